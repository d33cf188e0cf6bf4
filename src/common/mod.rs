pub mod addr;
pub mod error;
pub mod stream;
pub mod task;

pub use addr::Address;
pub use error::{RouterError, RouterErrorKind};
pub use stream::ProxyStream;
pub use task::{TaskHandle, TaskSet};
