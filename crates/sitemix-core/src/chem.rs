// SPDX-License-Identifier: Apache-2.0
//! Chemistry constants and kinetic→stochastic rate conversion.
//!
//! Values used when translating laboratory rate constants into the
//! per-event stochastic rates the scheduler consumes.

/// Avogadro's number (1/mol).
pub const AVOGADRO: f64 = 6.02214e23;

/// A diffusion-limited association rate (1/(M·s)).
pub const DIFFUSION_RATE: f64 = 1e9;

/// Dissociation constant of a weak interaction (M).
pub const KD_WEAK: f64 = 1e-6;
/// Dissociation constant of a moderate interaction (M).
pub const KD_MODERATE: f64 = 1e-7;
/// Dissociation constant of a strong interaction (M).
pub const KD_STRONG: f64 = 1e-8;

/// Typical fibroblast cell volume (L).
pub const VOLUME_FIBROBLAST: f64 = 2.25e-12;
/// Typical yeast cell volume (L).
pub const VOLUME_YEAST: f64 = 4.2e-14;

/// Room temperature (K).
pub const ROOM_TEMPERATURE: f64 = 273.15 + 25.0;

/// Converts a kinetic on-rate into the stochastic rate for a reaction of the
/// given order in a compartment of `volume` liters.
///
/// For a second-order reaction this is `k_on / (N_A · V)`.
#[must_use]
pub fn stochastic_on_rate(k_on: f64, volume: f64, order: i32) -> f64 {
    k_on / (AVOGADRO * volume.powi(order - 1))
}
