// Copyright 2025 Chartkeeper Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Custom resource definitions for the chartkeeper operator

pub mod annotation;
pub mod v1_alpha1;

pub use v1_alpha1::ChartRelease;
pub use v1_alpha1::ChartReleaseStatus;
pub use v1_alpha1::ReleaseSummary;
