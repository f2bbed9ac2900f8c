//! Labforge Core
//!
//! Core types shared by the Labforge job subsystem and its operators.
//!
//! This crate contains:
//! - Domain types: the job record, its lifecycle states and result artifacts
//! - DTOs: lightweight shapes used by callers of the job subsystem

pub mod domain;
pub mod dto;
