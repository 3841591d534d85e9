use crate::core::units::{STANDARD_PRESSURE_PA, ZERO_CELSIUS_K};
use num_dual::DualNum;

/// Isothermal compressibility of seawater near the surface, 1/Pa.
const COMPRESSIBILITY: f64 = 4.5e-10;

/// Pure water density at one atmosphere (kg/m³), `temperature` in K.
pub fn pure_water_density<D: DualNum<f64> + Copy>(temperature: D) -> D {
    let t = temperature - ZERO_CELSIUS_K;
    polynomial(
        t,
        &[999.842594, 6.793952e-2, -9.095290e-3, 1.001685e-4, -1.120083e-6, 6.536332e-9],
    )
}

/// Seawater density (kg/m³) from the EOS-80 one-atmosphere equation with a
/// linear compressibility correction.
///
/// `salinity` is the absolute salinity in g/kg of solution.
pub fn seawater_density<D: DualNum<f64> + Copy>(temperature: D, pressure: D, salinity: D) -> D {
    let t = temperature - ZERO_CELSIUS_K;
    let a = polynomial(t, &[8.24493e-1, -4.0899e-3, 7.6438e-5, -8.2467e-7, 5.3875e-9]);
    let b = polynomial(t, &[-5.72466e-3, 1.0227e-4, -1.6546e-6]);
    let c = 4.8314e-4;
    let rho0 = pure_water_density(temperature) + a * salinity + b * salinity.powf(1.5) + salinity * salinity * c;
    rho0 * ((pressure - STANDARD_PRESSURE_PA) * COMPRESSIBILITY + 1.0)
}

/// Saturation pressure of pure water (Pa) from the Antoine equation, valid
/// between 1 and 100 °C.
pub fn saturation_pressure<D: DualNum<f64> + Copy>(temperature: D) -> D {
    let t = temperature - ZERO_CELSIUS_K;
    let log10_mmhg = -(t + 233.426).recip() * 1730.63 + 8.07131;
    (log10_mmhg * std::f64::consts::LN_10).exp() * 133.322_368
}

/// Isobaric heat capacity of seawater (J/(kg·K)), `salinity` in g/kg.
pub fn seawater_heat_capacity<D: DualNum<f64> + Copy>(salinity: D) -> D {
    polynomial(salinity, &[4206.8, -6.6197, 1.2288e-2])
}

/// Sensible enthalpy (J) of `mass` kg of seawater relative to `reference` K.
pub fn sensible_enthalpy<D: DualNum<f64> + Copy>(mass: D, temperature: D, salinity: D, reference: f64) -> D {
    mass * seawater_heat_capacity(salinity) * (temperature - reference)
}

fn polynomial<D: DualNum<f64> + Copy>(x: D, coefficients: &[f64]) -> D {
    coefficients
        .iter()
        .rev()
        .fold(D::from(0.0), |acc, c| acc * x + *c)
}
