mod device;
mod image;

pub use device::{Device, DeviceCode, DeviceCodeError, DEVICE_CODE_LEN};
pub use image::{content_hash, Image};
