//! Column-oriented CSV tables.

use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::molecule::encode_or_empty;
use crate::parallel::ParallelMap;
use crate::runtime::{ArtifactWriter, Reporter};

/// A CSV file held as named string columns of equal length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    columns: Vec<Vec<String>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).with_context(|| format!("failed to open {:?}", path))?;
        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("failed to read header of {:?}", path))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut columns = vec![Vec::new(); headers.len()];
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("bad record {} in {:?}", line + 1, path))?;
            for (i, column) in columns.iter_mut().enumerate() {
                column.push(record.get(i).unwrap_or_default().to_string());
            }
        }
        log::debug!("read {} rows x {} columns from {:?}", columns.first().map_or(0, Vec::len), headers.len(), path);
        Ok(Self { headers, columns })
    }

    pub fn write_to(&self, out: &mut dyn Write) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(&self.headers)?;
        for row in 0..self.len() {
            writer.write_record(self.columns.iter().map(|c| c[row].as_str()))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Writes through `writer`, so non-primary ranks skip the file.
    pub fn save(&self, path: &Path, writer: &ArtifactWriter) -> Result<()> {
        if writer.write_with(path, |out| self.write_to(out))? {
            log::info!("saved {} rows to {:?}", self.len(), path);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Result<&[String]> {
        self.headers
            .iter()
            .position(|h| h == name)
            .map(|i| self.columns[i].as_slice())
            .ok_or_else(|| anyhow!("missing column '{}'", name))
    }

    /// Parses a numeric column. Empty or unparsable cells become `None`.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        Ok(self
            .column(name)?
            .iter()
            .map(|v| v.trim().parse::<f64>().ok())
            .collect())
    }

    /// Adds a column, or replaces it if the name exists.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if !self.headers.is_empty() && values.len() != self.len() {
            return Err(anyhow!(
                "column '{}' has {} values, table has {} rows",
                name,
                values.len(),
                self.len()
            ));
        }
        match self.headers.iter().position(|h| h == name) {
            Some(i) => self.columns[i] = values,
            None => {
                self.headers.push(name.to_string());
                self.columns.push(values);
            }
        }
        Ok(())
    }

    pub fn set_numeric_column(&mut self, name: &str, values: &[f64]) -> Result<()> {
        self.set_column(name, values.iter().map(|v| v.to_string()).collect())
    }
}

/// Reads the input molecules, deriving and caching a `selfies` column when
/// the file only has `smiles`. Failed encodes are cached as empty values.
pub fn load_input(
    path: &Path,
    pool: &ParallelMap,
    writer: &ArtifactWriter,
    reporter: &dyn Reporter,
) -> Result<Table> {
    reporter.info("Loading downstream dataset...");
    let mut table = Table::read(path)?;
    if !table.has_column("selfies") {
        reporter.info("convert smiles to selfies ...");
        let selfies = pool.map(table.column("smiles")?, |s| encode_or_empty(s));
        let failed = selfies.iter().filter(|s| s.is_empty()).count();
        if failed > 0 {
            log::warn!("{} of {} input SMILES could not be encoded", failed, selfies.len());
        }
        table.set_column("selfies", selfies)?;
        table.save(path, writer)?;
    }
    reporter.info("Finish loading!");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SilentReporter;

    #[test]
    fn test_read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "smiles,plogp\nCCO,1.5\n\"C,C\",\n").unwrap();
        let table = Table::read(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("smiles").unwrap()[1], "C,C");
        assert_eq!(table.numeric_column("plogp").unwrap(), vec![Some(1.5), None]);

        let mut out = Vec::new();
        table.write_to(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "smiles,plogp\nCCO,1.5\n\"C,C\",\n");
    }

    #[test]
    fn test_set_column_checks_length() {
        let mut table = Table::new();
        table.set_column("a", vec!["1".into(), "2".into()]).unwrap();
        table.set_column("a", vec!["3".into(), "4".into()]).unwrap();
        assert_eq!(table.headers(), &["a".to_string()]);
        assert!(table.set_column("b", vec!["x".into()]).is_err());
        assert!(table.column("missing").is_err());
    }

    #[test]
    fn test_load_input_caches_selfies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, "smiles\nCCO\nC1CC\n").unwrap();
        let pool = ParallelMap::new(2).unwrap();

        let table = load_input(&path, &pool, &ArtifactWriter::enabled(), &SilentReporter).unwrap();
        assert_eq!(table.column("selfies").unwrap(), &["[C][C][O]".to_string(), String::new()]);

        let cached = Table::read(&path).unwrap();
        assert!(cached.has_column("selfies"));
    }

    #[test]
    fn test_load_input_does_not_write_on_secondary_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, "smiles\nCC\n").unwrap();
        let pool = ParallelMap::new(1).unwrap();

        load_input(&path, &pool, &ArtifactWriter::disabled(), &SilentReporter).unwrap();
        assert!(!Table::read(&path).unwrap().has_column("selfies"));
    }
}
