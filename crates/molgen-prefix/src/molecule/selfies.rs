//! SELFIES encoder and decoder.
//!
//! Every SELFIES string decodes to a valid molecule: bond orders are capped by
//! the bonding capacity left on each atom, surplus branch/ring symbols are
//! ignored, and ring bonds are only formed once the whole fragment has been
//! derived.

use std::slice::Iter;

use super::smiles::Traversal;
use super::{bonding_capacity, is_known_element, kekulize, Atom, BondOrder, Molecule};
use crate::error::NotationError;

/// Symbols used as base-16 digits after branch and ring symbols.
pub const INDEX_ALPHABET: [&str; 16] = [
    "[C]",
    "[Ring1]",
    "[Ring2]",
    "[Branch1]",
    "[=Branch1]",
    "[#Branch1]",
    "[Branch2]",
    "[=Branch2]",
    "[#Branch2]",
    "[O]",
    "[N]",
    "[=N]",
    "[=C]",
    "[#C]",
    "[S]",
    "[P]",
];

const MAX_INDEX_DIGITS: usize = 3;

/// Splits a SELFIES string into bracketed symbols and `.` separators.
pub fn split_symbols(text: &str) -> Result<Vec<&str>, NotationError> {
    let mut symbols = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('.') {
            symbols.push(".");
            rest = stripped;
            continue;
        }
        if !rest.starts_with('[') {
            return Err(NotationError::SelfiesSyntax(format!("unexpected text '{}'", rest)));
        }
        let end = rest
            .find(']')
            .ok_or_else(|| NotationError::SelfiesSyntax(format!("unterminated symbol in '{}'", rest)))?;
        symbols.push(&rest[..=end]);
        rest = &rest[end + 1..];
    }
    Ok(symbols)
}

#[derive(Debug, Clone, PartialEq)]
enum Symbol {
    Atom { bond: u8, atom: Atom },
    Branch { bond: u8, digits: usize },
    Ring { bond: u8, digits: usize },
    Nop,
}

fn parse_symbol(symbol: &str) -> Result<Symbol, NotationError> {
    let malformed = || NotationError::SelfiesSymbol(symbol.to_string());
    let inner = symbol
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(malformed)?;

    let (bond, body) = match inner.chars().next() {
        Some('=') => (2, &inner[1..]),
        Some('#') => (3, &inner[1..]),
        Some('/') | Some('\\') => (1, &inner[1..]),
        _ => (1, inner),
    };

    if let Some(n) = body.strip_prefix("Branch") {
        return index_digits(n).map(|digits| Symbol::Branch { bond, digits }).ok_or_else(malformed);
    }
    if let Some(n) = body.strip_prefix("Ring") {
        return index_digits(n).map(|digits| Symbol::Ring { bond, digits }).ok_or_else(malformed);
    }
    if body == "nop" || body == "epsilon" {
        return Ok(Symbol::Nop);
    }
    Ok(Symbol::Atom {
        bond,
        atom: parse_atom_body(body).ok_or_else(malformed)?,
    })
}

fn index_digits(text: &str) -> Option<usize> {
    let n: usize = text.parse().ok()?;
    (1..=MAX_INDEX_DIGITS).contains(&n).then_some(n)
}

/// `isotope? Element chirality? (H count)? charge?`
fn parse_atom_body(body: &str) -> Option<Atom> {
    let chars: Vec<char> = body.chars().collect();
    let mut pos = 0;
    let number = |pos: &mut usize| -> Option<u32> {
        let start = *pos;
        while chars.get(*pos).is_some_and(|c| c.is_ascii_digit()) {
            *pos += 1;
        }
        if start == *pos {
            return None;
        }
        chars[start..*pos].iter().collect::<String>().parse().ok()
    };

    let isotope = number(&mut pos).map(|n| n as u16);

    let first = *chars.get(pos)?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    let two: String = chars[pos..].iter().take(2).collect();
    let element = if two.len() == 2 && is_known_element(&two) {
        two
    } else {
        first.to_string()
    };
    if !is_known_element(&element) {
        return None;
    }
    pos += element.len();

    while chars.get(pos) == Some(&'@') {
        pos += 1;
    }

    let mut hydrogens = None;
    if chars.get(pos) == Some(&'H') {
        pos += 1;
        hydrogens = Some(number(&mut pos).unwrap_or(1) as u8);
    }

    let mut charge: i8 = 0;
    if let Some(&sign_char) = chars.get(pos).filter(|c| **c == '+' || **c == '-') {
        let sign: i8 = if sign_char == '+' { 1 } else { -1 };
        pos += 1;
        charge = match number(&mut pos) {
            Some(n) => sign * i8::try_from(n).ok()?,
            None => {
                let mut magnitude = 1;
                while chars.get(pos) == Some(&sign_char) {
                    pos += 1;
                    magnitude += 1;
                }
                sign * magnitude
            }
        };
    }

    if pos != chars.len() {
        return None;
    }

    let bracketed = isotope.is_some() || hydrogens.is_some() || charge != 0 || !super::is_organic_subset(&element);
    let mut atom = Atom::new(element);
    atom.isotope = isotope;
    atom.charge = charge;
    atom.explicit_h = bracketed.then(|| hydrogens.unwrap_or(0));
    Some(atom)
}

fn capacity(atom: &Atom) -> u8 {
    bonding_capacity(&atom.element, atom.charge).saturating_sub(atom.explicit_h.unwrap_or(0))
}

fn read_index(symbols: &mut Iter<'_, &str>, digits: usize) -> usize {
    let mut value = 0;
    for _ in 0..digits {
        let Some(symbol) = symbols.next() else {
            break;
        };
        let digit = INDEX_ALPHABET.iter().position(|s| s == symbol).unwrap_or(0);
        value = value * INDEX_ALPHABET.len() + digit;
    }
    value
}

struct Derivation {
    mol: Molecule,
    capacity: Vec<u8>,
    /// `(earlier atom, later atom, order)` ring bonds waiting to be formed.
    rings: Vec<(usize, usize, u8)>,
    fragment_start: usize,
}

impl Derivation {
    fn add_atom(&mut self, atom: Atom) -> (usize, u8) {
        let cap = capacity(&atom);
        self.capacity.push(cap);
        (self.mol.add_atom(atom), cap)
    }

    fn free(&self, atom: usize) -> u8 {
        self.capacity[atom].saturating_sub(self.mol.bond_sum(atom))
    }

    /// Derives up to `max_symbols` symbols starting from `root` with `state`
    /// bonds available. Returns the number of symbols consumed.
    fn derive(
        &mut self,
        symbols: &mut Iter<'_, &str>,
        max_symbols: usize,
        mut state: Option<u8>,
        mut prev: Option<usize>,
    ) -> Result<usize, NotationError> {
        let mut consumed = 0;
        while state != Some(0) && consumed < max_symbols {
            let Some(symbol) = symbols.next() else {
                break;
            };
            consumed += 1;

            match parse_symbol(symbol)? {
                Symbol::Nop => {}
                Symbol::Atom { bond, atom } => match (prev, state) {
                    (Some(p), Some(s)) => {
                        let order = bond.min(s).min(capacity(&atom));
                        let Some(order_kind) = BondOrder::from_order(order) else {
                            // an atom with no capacity cannot attach
                            continue;
                        };
                        let (index, cap) = self.add_atom(atom);
                        self.mol.add_bond(p, index, order_kind);
                        state = Some(cap - order);
                        prev = Some(index);
                    }
                    _ => {
                        let (index, cap) = self.add_atom(atom);
                        state = Some(cap);
                        prev = Some(index);
                    }
                },
                Symbol::Branch { bond, digits } => {
                    if let Some(s) = state.filter(|&s| s > 1) {
                        let q = read_index(symbols, digits);
                        consumed += digits;
                        let init = (s - 1).min(bond);
                        consumed += self.derive(symbols, q + 1, Some(init), prev)?;
                        state = Some(s - init);
                    }
                }
                Symbol::Ring { bond, digits } => {
                    if let (Some(s), Some(p)) = (state.filter(|&s| s > 0), prev) {
                        let q = read_index(symbols, digits);
                        consumed += digits;
                        let order = bond.min(s);
                        let left = p.saturating_sub(q + 1).max(self.fragment_start);
                        self.rings.push((left, p, order));
                        state = Some(s - order);
                    }
                }
            }
        }
        Ok(consumed)
    }

    fn close_rings(&mut self) {
        for (left, right, order) in std::mem::take(&mut self.rings) {
            if left == right {
                continue;
            }
            let order = order.min(self.free(left)).min(self.free(right));
            if order == 0 {
                continue;
            }
            match self.mol.bond_between(left, right) {
                Some(id) => {
                    let merged = (self.mol.bonds[id].order.order() + order).min(3);
                    if let Some(kind) = BondOrder::from_order(merged) {
                        self.mol.bonds[id].order = kind;
                    }
                }
                None => {
                    if let Some(kind) = BondOrder::from_order(order) {
                        self.mol.add_bond(left, right, kind);
                    }
                }
            }
        }
    }
}

/// Decodes a SELFIES string. Only malformed symbols fail; any well-formed
/// symbol sequence yields a molecule.
pub fn decode_selfies(selfies: &str) -> Result<Molecule, NotationError> {
    let symbols = split_symbols(selfies)?;
    let mut derivation = Derivation {
        mol: Molecule::new(),
        capacity: Vec::new(),
        rings: Vec::new(),
        fragment_start: 0,
    };
    for fragment in symbols.split(|s| *s == ".") {
        derivation.fragment_start = derivation.mol.len();
        derivation.derive(&mut fragment.iter(), usize::MAX, None, None)?;
        derivation.close_rings();
    }
    Ok(derivation.mol)
}

fn bond_prefix(order: BondOrder) -> &'static str {
    match order {
        BondOrder::Double => "=",
        BondOrder::Triple => "#",
        BondOrder::Single | BondOrder::Aromatic => "",
    }
}

fn index_symbols(value: usize) -> Result<Vec<&'static str>, NotationError> {
    let base = INDEX_ALPHABET.len();
    let digits = (1..=MAX_INDEX_DIGITS)
        .find(|&n| value < base.pow(n as u32))
        .ok_or_else(|| NotationError::SelfiesSyntax(format!("index {} needs more than {} digits", value, MAX_INDEX_DIGITS)))?;
    Ok((0..digits)
        .rev()
        .map(|place| INDEX_ALPHABET[(value / base.pow(place as u32)) % base])
        .collect())
}

fn atom_token(mol: &Molecule, index: usize) -> Result<String, NotationError> {
    let atom = &mol.atoms[index];
    let bond_sum = mol.bond_sum(index);
    if atom.is_plain(bond_sum) {
        if bond_sum > bonding_capacity(&atom.element, 0) {
            return Err(NotationError::Valence {
                index,
                symbol: atom.element.clone(),
            });
        }
        return Ok(format!("[{}]", atom.element));
    }
    let mut token = String::from("[");
    if let Some(isotope) = atom.isotope {
        token.push_str(&isotope.to_string());
    }
    token.push_str(&atom.element);
    let h = atom.hydrogens(bond_sum);
    if h > 0 {
        token.push_str(&format!("H{}", h));
    }
    if atom.charge != 0 {
        token.push_str(&format!("{:+}", atom.charge));
    }
    token.push(']');
    Ok(token)
}

struct Encoder<'a> {
    mol: &'a Molecule,
    traversal: Traversal,
    position: Vec<usize>,
    /// Ring bonds closed at each atom: `(earlier atom, order)`.
    closures: Vec<Vec<(usize, BondOrder)>>,
}

impl Encoder<'_> {
    fn symbols(&self, atom: usize, incoming: Option<BondOrder>) -> Result<Vec<String>, NotationError> {
        let mut out = vec![format!(
            "[{}{}",
            incoming.map_or("", bond_prefix),
            &atom_token(self.mol, atom)?[1..]
        )];

        for &(earlier, order) in &self.closures[atom] {
            let distance = self.position[atom] - self.position[earlier] - 1;
            let digits = index_symbols(distance)?;
            out.push(format!("[{}Ring{}]", bond_prefix(order), digits.len()));
            out.extend(digits.into_iter().map(str::to_string));
        }

        let children = &self.traversal.children[atom];
        for (i, &child) in children.iter().enumerate() {
            let order = self
                .mol
                .bond_between(atom, child)
                .map_or(BondOrder::Single, |b| self.mol.bonds[b].order);
            let branch = self.symbols(child, Some(order))?;
            if i + 1 < children.len() {
                let digits = index_symbols(branch.len() - 1)?;
                out.push(format!("[{}Branch{}]", bond_prefix(order), digits.len()));
                out.extend(digits.into_iter().map(str::to_string));
            }
            out.extend(branch);
        }
        Ok(out)
    }
}

/// Encodes a molecule as SELFIES. Aromatic input is kekulized first.
pub fn encode_selfies(mol: &Molecule) -> Result<String, NotationError> {
    let kekulized;
    let mol = if mol.bonds.iter().any(|b| b.order == BondOrder::Aromatic) {
        let mut copy = mol.clone();
        kekulize(&mut copy)?;
        kekulized = copy;
        &kekulized
    } else {
        mol
    };

    let traversal = Traversal::new(mol);
    let mut position = vec![0; mol.len()];
    for (i, &atom) in traversal.order.iter().enumerate() {
        position[atom] = i;
    }
    let mut closures = vec![Vec::new(); mol.len()];
    for &(earlier, later, bond) in &traversal.ring_bonds {
        closures[later].push((earlier, mol.bonds[bond].order));
    }

    let roots = traversal.roots.clone();
    let encoder = Encoder {
        mol,
        traversal,
        position,
        closures,
    };
    let fragments = roots
        .into_iter()
        .map(|root| encoder.symbols(root, None).map(|s| s.concat()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fragments.join("."))
}
