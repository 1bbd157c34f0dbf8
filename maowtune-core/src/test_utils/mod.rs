pub mod fakes;
pub mod ogg;
