//! Low-level primitives the kernel is built on.

/// Positioned file I/O.
pub mod io;

/// Persistence windows, the window pool and the bounds-checked buffer cursor.
pub mod window;
