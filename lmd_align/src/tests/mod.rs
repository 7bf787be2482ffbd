//! Scenarios that cross module boundaries.
