//! Token vocabularies for SELFIES strings.
//!
//! [`SelfiesVocabTokenizer`] is the native vocabulary: BART's four special
//! tokens, the SELFIES symbols of a vocabulary file, then `<mask>`.
//! [`HfTokenizer`] wraps a `tokenizer.json` for checkpoints trained with one.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::Array2;
use tokenizers::Tokenizer;

use crate::molecule::split_symbols;

pub const BOS_TOKEN: &str = "<s>";
pub const PAD_TOKEN: &str = "<pad>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";
pub const MASK_TOKEN: &str = "<mask>";

/// A padded batch ready for the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub input_ids: Array2<u32>,
    /// `1.0` for real tokens, `0.0` for padding.
    pub attention_mask: Array2<f32>,
}

/// Padding and truncation options shared by all tokenizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingOptions {
    pub max_len: usize,
    pub pad_to_multiple_of: usize,
}

pub trait SequenceTokenizer: Send + Sync {
    /// Ids of one text including `<s>` / `</s>`, not truncated.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decodes ids, skipping special tokens and removing spaces.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn vocab_size(&self) -> usize;

    fn pad_id(&self) -> u32;

    fn eos_id(&self) -> u32;

    /// Encodes, truncates to `max_len` (keeping the final `</s>`) and pads to
    /// the longest row rounded up to `pad_to_multiple_of`, capped at `max_len`.
    fn encode_batch(&self, texts: &[String], options: PaddingOptions) -> Result<EncodedBatch> {
        let rows = texts
            .iter()
            .map(|t| self.encode(t).map(|ids| truncate(ids, options.max_len, self.eos_id())))
            .collect::<Result<Vec<_>>>()?;
        pad_batch(&rows, self.pad_id(), options)
    }
}

fn truncate(mut ids: Vec<u32>, max_len: usize, eos: u32) -> Vec<u32> {
    if ids.len() > max_len && max_len > 0 {
        ids.truncate(max_len);
        if let Some(last) = ids.last_mut() {
            *last = eos;
        }
    }
    ids
}

pub fn padded_length(longest: usize, options: PaddingOptions) -> usize {
    let multiple = options.pad_to_multiple_of.max(1);
    let rounded = longest.div_ceil(multiple) * multiple;
    rounded.min(options.max_len.max(longest))
}

pub fn pad_batch(rows: &[Vec<u32>], pad_id: u32, options: PaddingOptions) -> Result<EncodedBatch> {
    let longest = rows.iter().map(Vec::len).max().unwrap_or(0);
    let width = padded_length(longest, options);

    let mut input_ids = Array2::from_elem((rows.len(), width), pad_id);
    let mut attention_mask = Array2::<f32>::zeros((rows.len(), width));
    for (i, row) in rows.iter().enumerate() {
        for (j, &id) in row.iter().enumerate() {
            input_ids[[i, j]] = id;
            attention_mask[[i, j]] = 1.0;
        }
    }
    Ok(EncodedBatch {
        input_ids,
        attention_mask,
    })
}

#[derive(Debug, Clone)]
pub struct SelfiesVocabTokenizer {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
}

impl SelfiesVocabTokenizer {
    /// Builds the vocabulary from SELFIES symbols. Duplicates and specials are skipped.
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokens: Vec<String> = [BOS_TOKEN, PAD_TOKEN, EOS_TOKEN, UNK_TOKEN]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut ids: HashMap<String, u32> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();

        for symbol in symbols.into_iter().map(Into::into).chain(std::iter::once(MASK_TOKEN.to_string())) {
            if ids.contains_key(&symbol) {
                continue;
            }
            ids.insert(symbol.clone(), tokens.len() as u32);
            tokens.push(symbol);
        }
        Self { tokens, ids }
    }

    /// Reads a vocabulary file: a JSON array of symbols, or one symbol per line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary {:?}", path))?;
        let symbols: Vec<String> = if text.trim_start().starts_with('[') && path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&text).with_context(|| format!("failed to parse vocabulary {:?}", path))?
        } else {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        };
        let tokenizer = Self::new(symbols);
        log::info!("loaded SELFIES vocabulary: {} tokens", tokenizer.vocab_size());
        Ok(tokenizer)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    fn is_special(&self, id: u32) -> bool {
        id <= 3 || self.id_to_token(id) == Some(MASK_TOKEN)
    }
}

impl SequenceTokenizer for SelfiesVocabTokenizer {
    /// Whitespace is ignored. Text that does not split into bracketed
    /// symbols encodes as a single `<unk>`.
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let unk = self.ids[UNK_TOKEN];
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let mut ids = vec![self.ids[BOS_TOKEN]];
        match split_symbols(&compact) {
            Ok(symbols) => ids.extend(symbols.into_iter().map(|sym| self.token_to_id(sym).unwrap_or(unk))),
            Err(e) => {
                log::warn!("'{}' is not a SELFIES string ({}), encoding it as {}", text, e, UNK_TOKEN);
                ids.push(unk);
            }
        }
        ids.push(self.ids[EOS_TOKEN]);
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut out = String::new();
        for &id in ids {
            if self.is_special(id) {
                continue;
            }
            let token = self
                .id_to_token(id)
                .ok_or_else(|| anyhow!("token id {} is outside the vocabulary", id))?;
            out.push_str(token);
        }
        out.retain(|c| !c.is_whitespace());
        Ok(out)
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn pad_id(&self) -> u32 {
        1
    }

    fn eos_id(&self) -> u32 {
        2
    }
}

/// A `tokenizers` vocabulary loaded from `tokenizer.json`.
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_id: u32,
    eos_id: u32,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| anyhow!(e))?;
        let pad_id = inner.token_to_id(PAD_TOKEN).unwrap_or(1);
        let eos_id = inner.token_to_id(EOS_TOKEN).unwrap_or(2);
        log::info!(
            "loaded tokenizer {:?}: {} tokens",
            path.file_name().unwrap_or_default(),
            inner.get_vocab_size(true)
        );
        Ok(Self { inner, pad_id, eos_id })
    }
}

impl SequenceTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, true).map_err(|e| anyhow!(e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut text = self.inner.decode(ids, true).map_err(|e| anyhow!(e))?;
        text.retain(|c| !c.is_whitespace());
        Ok(text)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> SelfiesVocabTokenizer {
        SelfiesVocabTokenizer::new(["[C]", "[O]", "[=C]", "[Ring1]", "[Branch1]", "[C]"])
    }

    #[test]
    fn test_vocabulary_layout() {
        let tok = tokenizer();
        assert_eq!(tok.token_to_id("<s>"), Some(0));
        assert_eq!(tok.token_to_id("<pad>"), Some(1));
        assert_eq!(tok.token_to_id("</s>"), Some(2));
        assert_eq!(tok.token_to_id("<unk>"), Some(3));
        assert_eq!(tok.token_to_id("[C]"), Some(4));
        assert_eq!(tok.token_to_id("<mask>"), Some(9));
        assert_eq!(tok.vocab_size(), 10);
    }

    #[test]
    fn test_encode_adds_specials_and_unknowns() {
        let tok = tokenizer();
        assert_eq!(tok.encode("[C][O][F]").unwrap(), vec![0, 4, 5, 3, 2]);
    }

    #[test]
    fn test_encode_ignores_whitespace() {
        let tok = tokenizer();
        assert_eq!(tok.encode("[C] [O]\n").unwrap(), vec![0, 4, 5, 2]);
    }

    #[test]
    fn test_encode_maps_unsplittable_text_to_unk() {
        let tok = tokenizer();
        assert_eq!(tok.encode("CO").unwrap(), vec![0, 3, 2]);
        assert_eq!(tok.encode("[C][O").unwrap(), vec![0, 3, 2]);
        assert_eq!(tok.encode("").unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_decode_skips_specials() {
        let tok = tokenizer();
        assert_eq!(tok.decode(&[2, 0, 4, 6, 5, 2, 1, 1]).unwrap(), "[C][=C][O]");
        assert!(tok.decode(&[42]).is_err());
    }

    #[test]
    fn test_encode_batch_pads_to_multiple() {
        let tok = tokenizer();
        let texts = vec!["[C][O]".to_string(), "[C]".to_string()];
        let batch = tok
            .encode_batch(&texts, PaddingOptions { max_len: 16, pad_to_multiple_of: 8 })
            .unwrap();
        assert_eq!(batch.input_ids.dim(), (2, 8));
        assert_eq!(batch.input_ids.row(1).to_vec(), vec![0, 4, 2, 1, 1, 1, 1, 1]);
        assert_eq!(batch.attention_mask.row(0).sum(), 4.0);
        assert_eq!(batch.attention_mask.row(1).sum(), 3.0);
    }

    #[test]
    fn test_encode_batch_truncates_keeping_eos() {
        let tok = tokenizer();
        let texts = vec!["[C][C][C][C][C][C]".to_string()];
        let batch = tok
            .encode_batch(&texts, PaddingOptions { max_len: 4, pad_to_multiple_of: 8 })
            .unwrap();
        assert_eq!(batch.input_ids.row(0).to_vec(), vec![0, 4, 4, 2]);
    }

    #[test]
    fn test_vocab_file_formats() {
        let dir = tempfile::tempdir().unwrap();
        let lines = dir.path().join("vocab.txt");
        std::fs::write(&lines, "[C]\n[O]\n\n").unwrap();
        assert_eq!(SelfiesVocabTokenizer::from_file(&lines).unwrap().vocab_size(), 7);

        let json = dir.path().join("vocab.json");
        std::fs::write(&json, r#"["[C]", "[N]", "[O]"]"#).unwrap();
        let tok = SelfiesVocabTokenizer::from_file(&json).unwrap();
        assert_eq!(tok.token_to_id("[N]"), Some(5));
    }

    const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "<pad>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 3, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "WhitespaceSplit"},
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                {"SpecialToken": {"id": "<s>", "type_id": 0}},
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}}
            ],
            "pair": [
                {"SpecialToken": {"id": "<s>", "type_id": 0}},
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}},
                {"Sequence": {"id": "B", "type_id": 1}},
                {"SpecialToken": {"id": "</s>", "type_id": 1}}
            ],
            "special_tokens": {
                "<s>": {"id": "<s>", "ids": [0], "tokens": ["<s>"]},
                "</s>": {"id": "</s>", "ids": [2], "tokens": ["</s>"]}
            }
        },
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<s>": 0, "<pad>": 1, "</s>": 2, "<unk>": 3, "[C]": 4, "[O]": 5},
            "unk_token": "<unk>"
        }
    }"#;

    #[test]
    fn test_tokenizer_json_batch_and_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, WORD_LEVEL_JSON).unwrap();
        let tok = HfTokenizer::from_file(&path).unwrap();
        assert_eq!(tok.vocab_size(), 6);
        assert_eq!(tok.pad_id(), 1);
        assert_eq!(tok.eos_id(), 2);

        let texts = vec!["[C] [O]".to_string(), "[C] [N]".to_string()];
        let batch = tok
            .encode_batch(&texts, PaddingOptions { max_len: 16, pad_to_multiple_of: 8 })
            .unwrap();
        assert_eq!(batch.input_ids.row(0).to_vec(), vec![0, 4, 5, 2, 1, 1, 1, 1]);
        assert_eq!(batch.input_ids.row(1).to_vec(), vec![0, 4, 3, 2, 1, 1, 1, 1]);
        assert_eq!(batch.attention_mask.row(0).sum(), 4.0);

        assert_eq!(tok.decode(&[0, 4, 5, 2, 1, 1]).unwrap(), "[C][O]");
    }

    #[test]
    fn test_missing_tokenizer_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HfTokenizer::from_file(&dir.path().join("tokenizer.json")).is_err());
    }
}
