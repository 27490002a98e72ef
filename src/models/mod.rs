pub mod cookie;
pub mod request;
pub mod response;
pub mod rule;
pub mod upstream;

pub use cookie::*;
pub use request::*;
pub use response::*;
pub use rule::*;
pub use upstream::*;
