// Jackson Coxson

pub mod afc;
pub mod debug_proxy;
pub mod house_arrest;
pub mod installation_proxy;
pub mod lockdown;
pub mod mobile_image_mounter;
