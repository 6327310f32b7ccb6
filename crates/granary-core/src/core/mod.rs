// crates/granary-core/src/core/mod.rs
// ============================================================================
// Module: Granary Core Model
// Description: Identifiers, entity records, state machines, and faults.
// Purpose: Group the store's logical data model under one namespace.
// Dependencies: crate submodules
// ============================================================================

//! ## Overview
//! The core model mirrors the logical tables of the backing store one to
//! one. Records are plain data; all persistence behavior lives in the
//! backend crates.

pub mod fault;
pub mod identifiers;
pub mod records;
pub mod state;
