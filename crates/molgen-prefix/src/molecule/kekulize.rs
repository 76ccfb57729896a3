//! Assigns alternating single/double bonds to aromatic systems.

use super::{valences, BondOrder, Molecule};
use crate::error::NotationError;

/// Upper bound on matching attempts before a system is declared unkekulizable.
const SEARCH_BUDGET: usize = 100_000;

/// Whether an aromatic atom still needs a double bond inside its system.
fn needs_pi_bond(mol: &Molecule, atom: usize) -> bool {
    let a = &mol.atoms[atom];
    let Some(&lowest) = valences(&a.element, a.charge).first() else {
        return false;
    };
    let used = mol.bond_sum(atom) + a.explicit_h.unwrap_or(0);
    lowest > used
}

/// Replaces every aromatic bond with a single or double bond and clears the
/// aromatic flags. Fails when no perfect matching exists among the atoms
/// that need a double bond.
pub fn kekulize(mol: &mut Molecule) -> Result<(), NotationError> {
    if !mol.bonds.iter().any(|b| b.order == BondOrder::Aromatic) {
        for atom in &mut mol.atoms {
            atom.aromatic = false;
        }
        return Ok(());
    }

    let needs: Vec<bool> = (0..mol.len())
        .map(|i| mol.atoms[i].aromatic && needs_pi_bond(mol, i))
        .collect();

    // candidate edges: aromatic bonds whose two ends both need a pi bond
    let mut candidates: Vec<Vec<(usize, usize)>> = vec![Vec::new(); mol.len()];
    for (id, bond) in mol.bonds.iter().enumerate() {
        if bond.order == BondOrder::Aromatic && needs[bond.a] && needs[bond.b] {
            candidates[bond.a].push((bond.b, id));
            candidates[bond.b].push((bond.a, id));
        }
    }

    let mut partner: Vec<Option<usize>> = vec![None; mol.len()];
    let mut chosen: Vec<usize> = Vec::new();
    let mut budget = SEARCH_BUDGET;
    if !match_all(&needs, &candidates, &mut partner, &mut chosen, &mut budget) {
        return Err(NotationError::Kekulization);
    }

    for bond in &mut mol.bonds {
        if bond.order == BondOrder::Aromatic {
            bond.order = BondOrder::Single;
        }
    }
    for id in chosen {
        mol.bonds[id].order = BondOrder::Double;
    }
    for atom in &mut mol.atoms {
        atom.aromatic = false;
    }
    Ok(())
}

/// Backtracking perfect matching, always extending the most constrained atom.
fn match_all(
    needs: &[bool],
    candidates: &[Vec<(usize, usize)>],
    partner: &mut [Option<usize>],
    chosen: &mut Vec<usize>,
    budget: &mut usize,
) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;

    let free = |partner: &[Option<usize>], atom: usize| {
        candidates[atom]
            .iter()
            .filter(|(other, _)| partner[*other].is_none())
            .count()
    };

    let next = (0..needs.len())
        .filter(|&i| needs[i] && partner[i].is_none())
        .min_by_key(|&i| free(&*partner, i));
    let Some(atom) = next else {
        return true;
    };

    for &(other, bond) in &candidates[atom] {
        if partner[other].is_some() {
            continue;
        }
        partner[atom] = Some(other);
        partner[other] = Some(atom);
        chosen.push(bond);
        if match_all(needs, candidates, partner, chosen, budget) {
            return true;
        }
        chosen.pop();
        partner[atom] = None;
        partner[other] = None;
    }
    false
}
