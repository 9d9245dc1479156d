mod mpsc;
mod spsc;

pub use mpsc::MpscRing;
pub use spsc::SpscRing;
