mod local;

pub use local::Local;

#[cfg(feature = "upyun")]
mod upyun;
#[cfg(feature = "upyun")]
pub use upyun::{Upyun, UpyunConfig};
