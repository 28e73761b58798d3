pub mod analysis;
pub mod batch;
pub mod error;
pub mod gateway;
pub mod history;
pub mod retry;
pub mod scoring;
pub mod settings;
pub mod tools;
pub mod validation;
