pub mod change;
pub mod message;
pub mod order;

pub use change::{ChangeEvent, ChangeType};
pub use message::{ChatMessage, Notification, NotificationKind};
pub use order::{Order, OrderStatus, OrderStatusChange};
