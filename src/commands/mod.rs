pub mod completions;
pub mod configure;
pub mod sign;
pub mod stream;

pub use completions::CompletionsCommand;
pub use configure::ConfigureCommand;
pub use sign::SignCommand;
pub use stream::StreamCommand;
