//! SMILES reader and writer.

use std::collections::BTreeMap;

use super::{is_known_element, kekulize, Atom, BondOrder, Molecule};
use crate::error::NotationError;

const AROMATIC_ORGANIC: &[&str] = &["b", "c", "n", "o", "p", "s"];
const AROMATIC_BRACKET: &[&str] = &["se", "as", "te", "b", "c", "n", "o", "p", "s"];

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> NotationError {
        NotationError::SmilesParse {
            pos: self.pos,
            message: message.into(),
        }
    }

    fn number(&mut self) -> Option<u32> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        self.chars[start..self.pos].iter().collect::<String>().parse().ok()
    }

    /// Organic-subset atom outside brackets.
    fn organic_atom(&mut self) -> Result<Atom, NotationError> {
        let two: String = [self.peek(), self.peek_at(1)].iter().flatten().collect();
        if two == "Cl" || two == "Br" {
            self.pos += 2;
            return Ok(Atom::new(two));
        }
        let c = self.bump().ok_or_else(|| self.error("expected atom"))?;
        let symbol = c.to_string();
        if AROMATIC_ORGANIC.contains(&symbol.as_str()) {
            let mut atom = Atom::new(symbol.to_uppercase());
            atom.aromatic = true;
            return Ok(atom);
        }
        match c {
            'B' | 'C' | 'N' | 'O' | 'P' | 'S' | 'F' | 'I' => Ok(Atom::new(symbol)),
            '*' => Err(NotationError::UnsupportedElement(symbol)),
            _ => {
                self.pos -= 1;
                Err(self.error(format!("unexpected character '{}'", c)))
            }
        }
    }

    /// `[` isotope? symbol chirality? hcount? charge? class? `]`
    fn bracket_atom(&mut self) -> Result<Atom, NotationError> {
        self.bump();
        let isotope = self.number().map(|n| n as u16);

        let mut atom = self.bracket_symbol()?;
        atom.isotope = isotope;

        while self.peek() == Some('@') {
            self.pos += 1;
        }
        // extended chirality classes such as @TH1 / @SP2
        if self.peek().is_some_and(|c| c.is_ascii_uppercase() && c != 'H') && self.chars[self.pos - 1] == '@' {
            self.pos += 2;
            self.number();
        }

        atom.explicit_h = Some(0);
        if self.peek() == Some('H') {
            self.pos += 1;
            atom.explicit_h = Some(self.number().unwrap_or(1) as u8);
        }

        atom.charge = self.charge()?;

        if self.peek() == Some(':') {
            self.pos += 1;
            self.number().ok_or_else(|| self.error("expected atom class"))?;
        }
        if self.bump() != Some(']') {
            return Err(self.error("expected ']'"));
        }
        Ok(atom)
    }

    fn bracket_symbol(&mut self) -> Result<Atom, NotationError> {
        let first = self.peek().ok_or_else(|| self.error("unterminated bracket atom"))?;
        if first.is_ascii_lowercase() {
            let two: String = [self.peek(), self.peek_at(1)].iter().flatten().collect();
            let symbol = if AROMATIC_BRACKET.contains(&two.as_str()) {
                two
            } else {
                first.to_string()
            };
            if !AROMATIC_BRACKET.contains(&symbol.as_str()) {
                return Err(NotationError::UnsupportedElement(symbol));
            }
            self.pos += symbol.len();
            let mut chars = symbol.chars();
            let element: String = chars
                .next()
                .map(|c| c.to_ascii_uppercase())
                .into_iter()
                .chain(chars)
                .collect();
            let mut atom = Atom::new(element);
            atom.aromatic = true;
            return Ok(atom);
        }
        if !first.is_ascii_uppercase() {
            return Err(NotationError::UnsupportedElement(first.to_string()));
        }
        let two: String = [self.peek(), self.peek_at(1)].iter().flatten().collect();
        let symbol = if two.len() == 2 && is_known_element(&two) {
            two
        } else {
            first.to_string()
        };
        if !is_known_element(&symbol) {
            return Err(NotationError::UnsupportedElement(symbol));
        }
        self.pos += symbol.len();
        Ok(Atom::new(symbol))
    }

    fn charge(&mut self) -> Result<i8, NotationError> {
        let sign = match self.peek() {
            Some('+') => 1,
            Some('-') => -1,
            _ => return Ok(0),
        };
        let symbol = self.chars[self.pos];
        self.pos += 1;
        if let Some(n) = self.number() {
            return i8::try_from(n)
                .map(|n| sign * n)
                .map_err(|_| self.error("charge out of range"));
        }
        let mut magnitude = 1;
        while self.peek() == Some(symbol) {
            self.pos += 1;
            magnitude += 1;
        }
        Ok(sign * magnitude)
    }

    fn bond(&mut self) -> Result<Option<BondOrder>, NotationError> {
        let order = match self.peek() {
            Some('-') | Some('/') | Some('\\') => BondOrder::Single,
            Some('=') => BondOrder::Double,
            Some('#') => BondOrder::Triple,
            Some(':') => BondOrder::Aromatic,
            Some('$') => return Err(self.error("quadruple bonds are not supported")),
            _ => return Ok(None),
        };
        self.pos += 1;
        Ok(Some(order))
    }

    fn ring_label(&mut self) -> Result<Option<u32>, NotationError> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => {
                self.pos += 1;
                Ok(c.to_digit(10))
            }
            Some('%') => {
                self.pos += 1;
                let digits: String = (0..2).filter_map(|_| self.bump()).collect();
                if digits.len() != 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
                    return Err(self.error("expected two digits after '%'"));
                }
                Ok(digits.parse().ok())
            }
            _ => Ok(None),
        }
    }
}

fn default_bond(mol: &Molecule, a: usize, b: usize) -> BondOrder {
    if mol.atoms[a].aromatic && mol.atoms[b].aromatic {
        BondOrder::Aromatic
    } else {
        BondOrder::Single
    }
}

/// Parses a SMILES string into a kekulized, valence-checked graph.
pub fn parse_smiles(smiles: &str) -> Result<Molecule, NotationError> {
    let mut p = Parser::new(smiles.trim());
    let mut mol = Molecule::new();
    let mut prev: Option<usize> = None;
    let mut branches: Vec<Option<usize>> = Vec::new();
    let mut pending: Option<BondOrder> = None;
    let mut rings: BTreeMap<u32, (usize, Option<BondOrder>)> = BTreeMap::new();

    while let Some(c) = p.peek() {
        match c {
            '(' => {
                if prev.is_none() {
                    return Err(p.error("branch without a preceding atom"));
                }
                p.pos += 1;
                branches.push(prev);
            }
            ')' => {
                if pending.is_some() {
                    return Err(p.error("bond before ')'"));
                }
                p.pos += 1;
                prev = branches.pop().ok_or_else(|| p.error("unbalanced ')'"))?;
            }
            '.' => {
                if pending.is_some() {
                    return Err(p.error("bond before '.'"));
                }
                p.pos += 1;
                prev = None;
            }
            '-' | '=' | '#' | ':' | '/' | '\\' | '$' => {
                if pending.is_some() {
                    return Err(p.error("two consecutive bonds"));
                }
                pending = p.bond()?;
            }
            '0'..='9' | '%' => {
                let atom = prev.ok_or_else(|| p.error("ring bond without an atom"))?;
                let label = p.ring_label()?.ok_or_else(|| p.error("bad ring label"))?;
                match rings.remove(&label) {
                    Some((other, opened)) => {
                        if other == atom || mol.bond_between(atom, other).is_some() {
                            return Err(p.error(format!("invalid ring closure {}", label)));
                        }
                        let order = pending
                            .take()
                            .or(opened)
                            .unwrap_or_else(|| default_bond(&mol, atom, other));
                        mol.add_bond(other, atom, order);
                    }
                    None => {
                        rings.insert(label, (atom, pending.take()));
                    }
                }
            }
            _ => {
                let atom = if c == '[' { p.bracket_atom()? } else { p.organic_atom()? };
                let index = mol.add_atom(atom);
                if let Some(previous) = prev {
                    let order = pending
                        .take()
                        .unwrap_or_else(|| default_bond(&mol, previous, index));
                    mol.add_bond(previous, index, order);
                } else if pending.is_some() {
                    return Err(p.error("bond without a preceding atom"));
                }
                prev = Some(index);
            }
        }
    }

    if pending.is_some() {
        return Err(p.error("dangling bond"));
    }
    if !branches.is_empty() {
        return Err(p.error("unclosed branch"));
    }
    if let Some((&label, _)) = rings.iter().next() {
        return Err(NotationError::UnclosedRing(label));
    }
    if mol.is_empty() && !p.source.is_empty() {
        return Err(p.error("no atoms"));
    }

    kekulize(&mut mol)?;
    mol.check_valence()?;
    Ok(mol)
}

fn bond_symbol(order: BondOrder) -> &'static str {
    match order {
        BondOrder::Single => "",
        BondOrder::Double => "=",
        BondOrder::Triple => "#",
        BondOrder::Aromatic => ":",
    }
}

fn atom_symbol(mol: &Molecule, index: usize) -> String {
    let atom = &mol.atoms[index];
    let bond_sum = mol.bond_sum(index);
    if atom.is_plain(bond_sum) {
        return atom.element.clone();
    }
    let mut out = String::from("[");
    if let Some(isotope) = atom.isotope {
        out.push_str(&isotope.to_string());
    }
    out.push_str(&atom.element);
    match atom.hydrogens(bond_sum) {
        0 => {}
        1 => out.push('H'),
        h => out.push_str(&format!("H{}", h)),
    }
    match atom.charge {
        0 => {}
        1 => out.push('+'),
        -1 => out.push('-'),
        c if c > 0 => out.push_str(&format!("+{}", c)),
        c => out.push_str(&format!("-{}", -c)),
    }
    out.push(']');
    out
}

/// Depth-first spanning forest of a molecule, shared by both writers.
pub(super) struct Traversal {
    /// Atoms in emission order.
    pub order: Vec<usize>,
    /// Tree children of each atom, in emission order.
    pub children: Vec<Vec<usize>>,
    /// Ring bonds `(earlier atom, later atom, bond id)`.
    pub ring_bonds: Vec<(usize, usize, usize)>,
    /// First atom of each fragment.
    pub roots: Vec<usize>,
}

impl Traversal {
    pub fn new(mol: &Molecule) -> Self {
        let mut t = Traversal {
            order: Vec::with_capacity(mol.len()),
            children: vec![Vec::new(); mol.len()],
            ring_bonds: Vec::new(),
            roots: Vec::new(),
        };
        let mut visited = vec![false; mol.len()];
        let mut used = vec![false; mol.bonds.len()];
        for root in 0..mol.len() {
            if !visited[root] {
                t.roots.push(root);
                t.visit(mol, root, &mut visited, &mut used);
            }
        }
        t
    }

    fn visit(&mut self, mol: &Molecule, atom: usize, visited: &mut [bool], used: &mut [bool]) {
        visited[atom] = true;
        self.order.push(atom);
        for &bond in mol.bonds_of(atom) {
            if used[bond] {
                continue;
            }
            used[bond] = true;
            let other = mol.bonds[bond].other(atom);
            if visited[other] {
                self.ring_bonds.push((other, atom, bond));
            } else {
                self.children[atom].push(other);
                self.visit(mol, other, visited, used);
            }
        }
    }
}

/// Writes a SMILES string in Kekulé form.
pub fn write_smiles(mol: &Molecule) -> String {
    let traversal = Traversal::new(mol);

    // ring digits are opened at the earlier atom and closed at the later one
    let mut opens: Vec<Vec<usize>> = vec![Vec::new(); mol.len()];
    let mut closes: Vec<Vec<usize>> = vec![Vec::new(); mol.len()];
    for (ring, &(first, second, _)) in traversal.ring_bonds.iter().enumerate() {
        opens[first].push(ring);
        closes[second].push(ring);
    }

    let mut labels: Vec<Option<u32>> = vec![None; traversal.ring_bonds.len()];
    let mut in_use: Vec<u32> = Vec::new();
    let mut out = String::new();

    let mut writer = SmilesWriter {
        mol,
        traversal: &traversal,
        opens: &opens,
        closes: &closes,
        labels: &mut labels,
        in_use: &mut in_use,
    };
    for (i, &root) in traversal.roots.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        writer.emit(root, &mut out);
    }
    out
}

struct SmilesWriter<'a> {
    mol: &'a Molecule,
    traversal: &'a Traversal,
    opens: &'a [Vec<usize>],
    closes: &'a [Vec<usize>],
    labels: &'a mut Vec<Option<u32>>,
    in_use: &'a mut Vec<u32>,
}

impl SmilesWriter<'_> {
    fn label_text(label: u32) -> String {
        if label < 10 {
            label.to_string()
        } else {
            format!("%{}", label)
        }
    }

    fn emit(&mut self, atom: usize, out: &mut String) {
        let (mol, traversal) = (self.mol, self.traversal);
        out.push_str(&atom_symbol(mol, atom));

        for &ring in &self.closes[atom] {
            if let Some(label) = self.labels[ring] {
                out.push_str(&Self::label_text(label));
                self.in_use.retain(|&l| l != label);
            }
        }
        for &ring in &self.opens[atom] {
            let label = (1..).find(|l| !self.in_use.contains(l)).unwrap_or(1);
            self.in_use.push(label);
            self.labels[ring] = Some(label);
            let (_, _, bond) = traversal.ring_bonds[ring];
            out.push_str(bond_symbol(mol.bonds[bond].order));
            out.push_str(&Self::label_text(label));
        }

        let children = &traversal.children[atom];
        for (i, &child) in children.iter().enumerate() {
            let symbol = mol
                .bond_between(atom, child)
                .map_or("", |b| bond_symbol(mol.bonds[b].order));
            if i + 1 < children.len() {
                out.push('(');
                out.push_str(symbol);
                self.emit(child, out);
                out.push(')');
            } else {
                out.push_str(symbol);
                self.emit(child, out);
            }
        }
    }
}
