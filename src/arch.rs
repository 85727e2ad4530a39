//! Platform-specific register contexts.
//!
//! Provides the same `Context` / `context_switch` pair for x86_64 (System V)
//! and aarch64 (AAPCS64).

#[cfg(all(target_arch = "x86_64", unix))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", unix))]
pub use x86_64::*;

#[cfg(all(target_arch = "aarch64", unix))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", unix))]
pub use aarch64::*;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("myfiber supports only x86_64 and aarch64 on unix");
