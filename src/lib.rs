//! Workspace root for the erssi relay bridge.
//!
//! The runnable pieces live in the member crates: `relay-codec` (the
//! downstream typed-object wire format), `erssi-proto` (the upstream
//! message model and frame crypto), and `services/bridge` (the drivers,
//! the store, and the orchestrator). This package hosts the cross-crate
//! integration suites under `tests/integration/`.
