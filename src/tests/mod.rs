//! Cross-module test suites. Module-local behaviour is tested next to the
//! code; everything here drives a whole kernel on the host backend or checks
//! data-structure properties.

pub(crate) mod helpers;
mod integration;
mod property;
