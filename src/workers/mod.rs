pub mod args;
pub mod transfer;
