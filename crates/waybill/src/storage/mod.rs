pub mod filesystem;

pub use filesystem::PayloadStore;
