pub mod tools;
pub mod weather;

pub use tools::proxy_tool_request;
pub use weather::current_weather;
