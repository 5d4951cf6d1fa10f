pub mod kubernetes;
pub mod manifest;
