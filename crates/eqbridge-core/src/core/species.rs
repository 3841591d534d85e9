use phf::{Map, phf_map};

/// Canonical name of the solvent species.
pub const SOLVENT: &str = "H2O(aq)";

/// Elements carried through mass-balance aggregation, in input order.
///
/// Hydrogen and oxygen are not aggregated: the solvent mass and the fixed pH
/// account for them.
pub const ELEMENTS: [&str; 9] = ["Na", "K", "Ca", "Mg", "Sr", "Cl", "Br", "S", "C"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeciesData {
    pub charge: i8,
    /// g/mol
    pub molar_mass: f64,
    pub elements: &'static [(&'static str, f64)],
}

/// A host-side species label and the canonical species it stands for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostAlias {
    /// Molar mass of the host species as written (g/mol).
    pub molar_mass: f64,
    pub species: &'static [(&'static str, f64)],
}

pub static SPECIES: Map<&'static str, SpeciesData> = phf_map! {
    "H2O(aq)" => SpeciesData { charge: 0, molar_mass: 18.015, elements: &[] },
    "Na+" => SpeciesData { charge: 1, molar_mass: 22.990, elements: &[("Na", 1.0)] },
    "K+" => SpeciesData { charge: 1, molar_mass: 39.098, elements: &[("K", 1.0)] },
    "Ca+2" => SpeciesData { charge: 2, molar_mass: 40.078, elements: &[("Ca", 1.0)] },
    "Mg+2" => SpeciesData { charge: 2, molar_mass: 24.305, elements: &[("Mg", 1.0)] },
    "Sr+2" => SpeciesData { charge: 2, molar_mass: 87.62, elements: &[("Sr", 1.0)] },
    "Cl-" => SpeciesData { charge: -1, molar_mass: 35.453, elements: &[("Cl", 1.0)] },
    "Br-" => SpeciesData { charge: -1, molar_mass: 79.904, elements: &[("Br", 1.0)] },
    "SO4-2" => SpeciesData { charge: -2, molar_mass: 96.06, elements: &[("S", 1.0)] },
    "HCO3-" => SpeciesData { charge: -1, molar_mass: 61.017, elements: &[("C", 1.0)] },
    "CO3-2" => SpeciesData { charge: -2, molar_mass: 60.009, elements: &[("C", 1.0)] },
    "CO2(aq)" => SpeciesData { charge: 0, molar_mass: 44.009, elements: &[("C", 1.0)] },
};

pub static HOST_ALIASES: Map<&'static str, HostAlias> = phf_map! {
    "H2O" => HostAlias { molar_mass: 18.015, species: &[("H2O(aq)", 1.0)] },
    "Na" => HostAlias { molar_mass: 22.990, species: &[("Na+", 1.0)] },
    "K" => HostAlias { molar_mass: 39.098, species: &[("K+", 1.0)] },
    "Ca" => HostAlias { molar_mass: 40.078, species: &[("Ca+2", 1.0)] },
    "Mg" => HostAlias { molar_mass: 24.305, species: &[("Mg+2", 1.0)] },
    "Sr" => HostAlias { molar_mass: 87.62, species: &[("Sr+2", 1.0)] },
    "Cl" => HostAlias { molar_mass: 35.453, species: &[("Cl-", 1.0)] },
    "Br" => HostAlias { molar_mass: 79.904, species: &[("Br-", 1.0)] },
    "SO4" => HostAlias { molar_mass: 96.06, species: &[("SO4-2", 1.0)] },
    "HCO3" => HostAlias { molar_mass: 61.017, species: &[("HCO3-", 1.0)] },
    "CO3" => HostAlias { molar_mass: 60.009, species: &[("CO3-2", 1.0)] },
    "CO2" => HostAlias { molar_mass: 44.009, species: &[("CO2(aq)", 1.0)] },
    "NaCl" => HostAlias { molar_mass: 58.443, species: &[("Na+", 1.0), ("Cl-", 1.0)] },
    "KCl" => HostAlias { molar_mass: 74.551, species: &[("K+", 1.0), ("Cl-", 1.0)] },
    "CaCl2" => HostAlias { molar_mass: 110.98, species: &[("Ca+2", 1.0), ("Cl-", 2.0)] },
    "MgCl2" => HostAlias { molar_mass: 95.211, species: &[("Mg+2", 1.0), ("Cl-", 2.0)] },
    "Na2SO4" => HostAlias { molar_mass: 142.04, species: &[("Na+", 2.0), ("SO4-2", 1.0)] },
    "MgSO4" => HostAlias { molar_mass: 120.37, species: &[("Mg+2", 1.0), ("SO4-2", 1.0)] },
    "NaHCO3" => HostAlias { molar_mass: 84.007, species: &[("Na+", 1.0), ("HCO3-", 1.0)] },
};

pub fn species(name: &str) -> Option<&'static SpeciesData> {
    SPECIES.get(name)
}

pub fn host_alias(label: &str) -> Option<&'static HostAlias> {
    HOST_ALIASES.get(label)
}

pub fn element_index(element: &str) -> Option<usize> {
    ELEMENTS.iter().position(|e| *e == element)
}

#[inline]
pub fn is_solvent(name: &str) -> bool {
    name == SOLVENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_alias_resolves_to_known_species() {
        for (label, alias) in HOST_ALIASES.entries() {
            for (name, coeff) in alias.species {
                assert!(species(name).is_some(), "alias {label} -> {name} is unknown");
                assert!(*coeff > 0.0);
            }
        }
    }

    #[test]
    fn alias_molar_masses_match_their_species() {
        for (label, alias) in HOST_ALIASES.entries() {
            let sum: f64 = alias
                .species
                .iter()
                .map(|(name, coeff)| species(name).unwrap().molar_mass * coeff)
                .sum();
            assert!(
                (sum - alias.molar_mass).abs() < 0.05,
                "{label}: {sum} vs {}",
                alias.molar_mass
            );
        }
    }

    #[test]
    fn species_elements_are_all_tracked() {
        for (name, data) in SPECIES.entries() {
            for (element, _) in data.elements {
                assert!(element_index(element).is_some(), "{name} has untracked {element}");
            }
        }
        assert_eq!(species("SO4-2").unwrap().charge, -2);
        assert!(species("SO4").is_none());
    }

    #[test]
    fn host_labels_map_to_canonical_names() {
        assert_eq!(host_alias("HCO3").unwrap().species, &[("HCO3-", 1.0)]);
        assert!(host_alias("Unobtainium").is_none());
        assert!(is_solvent(host_alias("H2O").unwrap().species[0].0));
    }
}
