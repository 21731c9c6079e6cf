//! Synchronization primitives layered on `std::sync` for the recursive and
//! blocking-with-timeout patterns the transport and mux layers need.

pub mod recmutex;

pub use recmutex::RecursiveMutex;
