// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astro_util;
pub mod astrometry_subprocess;
pub mod capture;
pub mod config;
pub mod csv_mirror;
pub mod pass_scheduler;
pub mod reconciler;
pub mod session_store;
pub mod shot_record;
pub mod solver_trait;
pub mod value_stats;
