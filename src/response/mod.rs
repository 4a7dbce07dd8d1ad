//! Response payload helpers - base64, data URIs and image sniffing

pub mod base64;
