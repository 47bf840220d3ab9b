pub mod helper;
pub mod request;
pub mod response;

pub use helper::{Encoding, ResponseInfo};
pub use request::{HttpRequest, Method, Version};
pub use response::{HttpResponse, StatusCode};
