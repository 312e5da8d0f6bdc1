// Technical indicators module

pub mod momentum;

pub use momentum::momentum;
