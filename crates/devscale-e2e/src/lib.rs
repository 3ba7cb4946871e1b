//! Black-box scenario tests for the devscale binaries. Everything lives
//! in `tests/`; build the workspace binaries first so the helpers can
//! spawn them.
