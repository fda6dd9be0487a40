mod client;
mod paths;

pub use client::{
    ApiErrorClass, ApiResponse, CopyAction, FileboxClient, FileboxError, UsbDevice,
};
pub use paths::strip_account_prefix;
