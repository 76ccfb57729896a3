//! Molecular graphs and their two line notations.
//!
//! SMILES is what users read and what property scorers consume; SELFIES is
//! what the model speaks. Both go through the same [`Molecule`] graph:
//! aromatic SMILES input is kekulized on parse, and every writer emits the
//! Kekulé form.
//!
//! Stereochemistry (`@`, `/`, `\`) is accepted on input and dropped.

mod kekulize;
mod selfies;
mod smiles;


pub use kekulize::kekulize;
pub use selfies::{decode_selfies, encode_selfies, split_symbols, INDEX_ALPHABET};
pub use smiles::{parse_smiles, write_smiles};

use crate::error::NotationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BondOrder {
    Single,
    Double,
    Triple,
    /// Only present between parsing and kekulization.
    Aromatic,
}

impl BondOrder {
    pub fn from_order(order: u8) -> Option<Self> {
        match order {
            1 => Some(BondOrder::Single),
            2 => Some(BondOrder::Double),
            3 => Some(BondOrder::Triple),
            _ => None,
        }
    }

    /// Valence contribution; aromatic bonds count as single until kekulized.
    pub fn order(self) -> u8 {
        match self {
            BondOrder::Single | BondOrder::Aromatic => 1,
            BondOrder::Double => 2,
            BondOrder::Triple => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub element: String,
    pub aromatic: bool,
    pub isotope: Option<u16>,
    pub charge: i8,
    /// Hydrogen count written in brackets. `None` means implicit.
    pub explicit_h: Option<u8>,
}

impl Atom {
    pub fn new(element: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            aromatic: false,
            isotope: None,
            charge: 0,
            explicit_h: None,
        }
    }

    /// Whether the atom may be written without brackets given its bond sum.
    pub fn is_plain(&self, bond_sum: u8) -> bool {
        is_organic_subset(&self.element)
            && self.charge == 0
            && self.isotope.is_none()
            && self
                .explicit_h
                .map_or(true, |h| h == implicit_hydrogens(&self.element, bond_sum))
    }

    pub fn hydrogens(&self, bond_sum: u8) -> u8 {
        match self.explicit_h {
            Some(h) => h,
            None if is_organic_subset(&self.element) => implicit_hydrogens(&self.element, bond_sum),
            None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bond {
    pub a: usize,
    pub b: usize,
    pub order: BondOrder,
}

impl Bond {
    pub fn other(&self, atom: usize) -> usize {
        if self.a == atom {
            self.b
        } else {
            self.a
        }
    }
}

/// An undirected molecular graph with explicit bond orders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Molecule {
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
    adjacency: Vec<Vec<usize>>,
}

impl Molecule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_atom(&mut self, atom: Atom) -> usize {
        self.atoms.push(atom);
        self.adjacency.push(Vec::new());
        self.atoms.len() - 1
    }

    pub fn add_bond(&mut self, a: usize, b: usize, order: BondOrder) -> usize {
        self.bonds.push(Bond { a, b, order });
        let id = self.bonds.len() - 1;
        self.adjacency[a].push(id);
        self.adjacency[b].push(id);
        id
    }

    pub fn bond_between(&self, a: usize, b: usize) -> Option<usize> {
        self.adjacency[a]
            .iter()
            .copied()
            .find(|&id| self.bonds[id].other(a) == b)
    }

    /// Bond ids incident to `atom`, in insertion order.
    pub fn bonds_of(&self, atom: usize) -> &[usize] {
        &self.adjacency[atom]
    }

    pub fn bond_sum(&self, atom: usize) -> u8 {
        self.adjacency[atom]
            .iter()
            .map(|&id| self.bonds[id].order.order())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Checks every atom against the valences its element allows.
    pub fn check_valence(&self) -> Result<(), NotationError> {
        for (index, atom) in self.atoms.iter().enumerate() {
            let allowed = smiles_valences(&atom.element, atom.charge);
            let Some(&max) = allowed.iter().max() else {
                continue;
            };
            let used = self.bond_sum(index) + atom.explicit_h.unwrap_or(0);
            if used > max {
                return Err(NotationError::Valence {
                    index,
                    symbol: atom.element.clone(),
                });
            }
        }
        Ok(())
    }
}

/// `(symbol, valence electrons, may expand its octet)`.
const ELEMENTS: &[(&str, u8, bool)] = &[
    ("H", 1, false),
    ("B", 3, false),
    ("C", 4, false),
    ("N", 5, false),
    ("O", 6, false),
    ("F", 7, false),
    ("Si", 4, false),
    ("P", 5, true),
    ("S", 6, true),
    ("Cl", 7, false),
    ("Ge", 4, false),
    ("As", 5, true),
    ("Se", 6, true),
    ("Br", 7, false),
    ("Te", 6, true),
    ("I", 7, false),
];

/// Elements accepted in brackets without valence rules.
const OTHER_ELEMENTS: &[&str] = &[
    "He", "Li", "Be", "Ne", "Na", "Mg", "Al", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe",
    "Co", "Ni", "Cu", "Zn", "Ga", "Kr", "Rb", "Sr", "Zr", "Mo", "Ru", "Rh", "Pd", "Ag", "Cd",
    "In", "Sn", "Sb", "Xe", "Cs", "Ba", "Gd", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi",
];

const ORGANIC_SUBSET: &[&str] = &["B", "C", "N", "O", "P", "S", "F", "Cl", "Br", "I"];

pub fn is_known_element(symbol: &str) -> bool {
    ELEMENTS.iter().any(|(s, _, _)| *s == symbol) || OTHER_ELEMENTS.contains(&symbol)
}

pub fn is_organic_subset(symbol: &str) -> bool {
    ORGANIC_SUBSET.contains(&symbol)
}

/// Normal valences of an element in a given charge state, lowest first.
/// Empty for elements without valence rules.
pub fn valences(element: &str, charge: i8) -> Vec<u8> {
    let Some(&(_, electrons, expands)) = ELEMENTS.iter().find(|(s, _, _)| *s == element) else {
        return Vec::new();
    };
    let effective = electrons as i16 - charge as i16;
    if !(0..=8).contains(&effective) {
        return Vec::new();
    }
    let base = if effective <= 4 { effective } else { 8 - effective };
    let mut out = vec![base as u8];
    if expands && effective > 4 {
        let mut v = base + 2;
        while v <= effective {
            out.push(v as u8);
            v += 2;
        }
    }
    out
}

/// Valences SMILES accepts; neutral nitrogen may also be pentavalent.
fn smiles_valences(element: &str, charge: i8) -> Vec<u8> {
    let mut out = valences(element, charge);
    if element == "N" && charge == 0 {
        out.push(5);
    }
    out
}

/// Hydrogens an organic-subset atom carries implicitly at `bond_sum`.
pub fn implicit_hydrogens(element: &str, bond_sum: u8) -> u8 {
    smiles_valences(element, 0)
        .into_iter()
        .find(|&v| v >= bond_sum)
        .map_or(0, |v| v - bond_sum)
}

/// Maximum bonds (including hydrogens) an atom may form during SELFIES derivation.
pub fn bonding_capacity(element: &str, charge: i8) -> u8 {
    valences(element, charge).into_iter().max().unwrap_or(8)
}

/// SMILES to SELFIES.
pub fn smiles_to_selfies(smiles: &str) -> Result<String, NotationError> {
    encode_selfies(&parse_smiles(smiles)?)
}

/// SELFIES to SMILES.
pub fn selfies_to_smiles(selfies: &str) -> Result<String, NotationError> {
    Ok(write_smiles(&decode_selfies(selfies)?))
}

/// SELFIES to SMILES, or the empty string when the input cannot be decoded.
pub fn decode_or_empty(selfies: &str) -> String {
    let trimmed: String = selfies.chars().filter(|c| !c.is_whitespace()).collect();
    match selfies_to_smiles(&trimmed) {
        Ok(smiles) => smiles,
        Err(e) => {
            log::debug!("cannot decode SELFIES '{}': {}", trimmed, e);
            String::new()
        }
    }
}

/// SMILES to SELFIES, or the empty string when the input cannot be encoded.
pub fn encode_or_empty(smiles: &str) -> String {
    match smiles_to_selfies(smiles.trim()) {
        Ok(selfies) => selfies,
        Err(e) => {
            log::debug!("cannot encode SMILES '{}': {}", smiles, e);
            String::new()
        }
    }
}
