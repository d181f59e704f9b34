pub mod config;
pub mod engine;
pub mod logging;
pub mod output;
pub mod request;
pub mod sampling;
pub mod stop;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
