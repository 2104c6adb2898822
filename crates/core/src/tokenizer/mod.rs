//! From-scratch byte-level BPE tokenizer compatible with the GPT-2 style
//! `vocab.json` + `merges.txt` export format.

use std::{
    collections::HashMap,
    path::Path,
};

use anyhow::Result;
use fancy_regex::Regex;
use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::debug;

use crate::error::EngineError;

mod bytes;

pub use bytes::{byte_to_char, char_to_byte};

/// Reserved literal marking where vision features are spliced into the prompt.
pub const IMAGE_TOKEN: &str = "<image>";

/// GPT-2 pre-tokenization pattern: contraction endings, letter runs, digit runs,
/// symbol runs (each run optionally absorbing one leading space), then whitespace.
/// The trailing-whitespace alternative needs the negative lookahead, hence
/// `fancy_regex` rather than `regex`.
static PRETOKENIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+")
        .expect("pre-tokenization pattern is valid")
});

#[derive(Debug, Deserialize)]
struct AddedToken {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenizerConfigFile {
    chat_template: Option<String>,
    added_tokens_decoder: HashMap<String, AddedToken>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialTokenRef {
    Plain(String),
    Tagged { content: String },
}

impl SpecialTokenRef {
    fn content(&self) -> &str {
        match self {
            SpecialTokenRef::Plain(text) => text,
            SpecialTokenRef::Tagged { content } => content,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpecialTokensMapFile {
    eos_token: Option<SpecialTokenRef>,
    pad_token: Option<SpecialTokenRef>,
}

/// Byte-level BPE tokenizer. Immutable after load and shareable across
/// concurrent generations.
#[derive(Debug)]
pub struct BpeTokenizer {
    vocab: HashMap<String, i64>,
    id_to_token: HashMap<i64, String>,
    merge_ranks: HashMap<(String, String), usize>,
    special_to_id: HashMap<String, i64>,
    id_to_special: HashMap<i64, String>,
    /// Special literals sorted longest-first so that two specials starting at the
    /// same text offset resolve deterministically to the longer literal.
    specials_by_len: Vec<String>,
    unk_id: Option<i64>,
    eos_id: Option<i64>,
    pad_id: Option<i64>,
    image_id: Option<i64>,
    chat_template: Option<String>,
}

impl BpeTokenizer {
    /// Load `vocab.json`, `merges.txt`, and the optional `tokenizer_config.json` /
    /// `special_tokens_map.json` from a tokenizer directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let vocab_raw = read_resource(&dir.join("vocab.json"))?;
        let vocab: HashMap<String, i64> = serde_json::from_str(&vocab_raw).map_err(|err| {
            EngineError::ResourceLoad(format!("failed to parse vocab.json: {err}"))
        })?;

        let merges_raw = read_resource(&dir.join("merges.txt"))?;
        let mut merges = Vec::new();
        for (line_no, line) in merges_raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(first), Some(second), None) => {
                    merges.push((first.to_owned(), second.to_owned()));
                }
                _ => {
                    return Err(EngineError::ResourceLoad(format!(
                        "merges.txt line {} is not a symbol pair: `{line}`",
                        line_no + 1
                    ))
                    .into());
                }
            }
        }

        let mut specials = HashMap::new();
        let mut chat_template = None;
        let config_path = dir.join("tokenizer_config.json");
        if config_path.exists() {
            let config_raw = read_resource(&config_path)?;
            let config: TokenizerConfigFile =
                serde_json::from_str(&config_raw).map_err(|err| {
                    EngineError::ResourceLoad(format!(
                        "failed to parse tokenizer_config.json: {err}"
                    ))
                })?;
            for (id_text, token) in config.added_tokens_decoder {
                let id: i64 = id_text.parse().map_err(|_| {
                    EngineError::ResourceLoad(format!(
                        "added_tokens_decoder key `{id_text}` is not an integer id"
                    ))
                })?;
                specials.insert(token.content, id);
            }
            chat_template = config.chat_template;
        }

        let mut tokenizer = Self::from_parts(vocab, merges, specials)?;
        tokenizer.chat_template = chat_template;

        let map_path = dir.join("special_tokens_map.json");
        if map_path.exists() {
            let map_raw = read_resource(&map_path)?;
            let map: SpecialTokensMapFile = serde_json::from_str(&map_raw).map_err(|err| {
                EngineError::ResourceLoad(format!(
                    "failed to parse special_tokens_map.json: {err}"
                ))
            })?;
            if let Some(token) = map.eos_token {
                tokenizer.eos_id = tokenizer.special_to_id.get(token.content()).copied();
            }
            if let Some(token) = map.pad_token {
                tokenizer.pad_id = tokenizer.special_to_id.get(token.content()).copied();
            }
        }

        debug!(
            vocab = tokenizer.vocab.len(),
            merges = tokenizer.merge_ranks.len(),
            specials = tokenizer.special_to_id.len(),
            "tokenizer loaded"
        );
        Ok(tokenizer)
    }

    /// Build a tokenizer from already-parsed tables. Merge rank equals position in
    /// `merges`; rank 0 is applied first.
    pub fn from_parts(
        vocab: HashMap<String, i64>,
        merges: Vec<(String, String)>,
        specials: HashMap<String, i64>,
    ) -> Result<Self> {
        let mut id_to_token = HashMap::with_capacity(vocab.len());
        for (token, &id) in &vocab {
            if id < 0 {
                return Err(EngineError::ResourceLoad(format!(
                    "vocabulary id for `{token}` is negative"
                ))
                .into());
            }
            if id_to_token.insert(id, token.clone()).is_some() {
                return Err(EngineError::ResourceLoad(format!(
                    "vocabulary id {id} is assigned to more than one token"
                ))
                .into());
            }
        }

        let merge_ranks: HashMap<(String, String), usize> = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();

        let mut id_to_special = HashMap::with_capacity(specials.len());
        for (literal, &id) in &specials {
            id_to_special.insert(id, literal.clone());
        }
        let mut specials_by_len: Vec<String> = specials.keys().cloned().collect();
        specials_by_len.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let unk_id = vocab.get("<unk>").copied();
        let image_id = specials.get(IMAGE_TOKEN).copied();
        Ok(Self {
            vocab,
            id_to_token,
            merge_ranks,
            special_to_id: specials,
            id_to_special,
            specials_by_len,
            unk_id,
            eos_id: None,
            pad_id: None,
            image_id,
            chat_template: None,
        })
    }

    /// Encode text into token ids. Deterministic; registered special literals are
    /// emitted as their reserved ids and never enter the merge loop.
    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            match self.find_special(rest) {
                Some((start, literal)) => {
                    self.encode_span(&rest[..start], &mut ids)?;
                    ids.push(self.special_to_id[literal]);
                    rest = &rest[start + literal.len()..];
                }
                None => {
                    self.encode_span(rest, &mut ids)?;
                    break;
                }
            }
        }
        Ok(ids)
    }

    /// Decode ids back into text. Special-token ids are skipped and the byte
    /// stream is interpreted as UTF-8, then trimmed. Byte sequences that are not
    /// valid UTF-8 are rendered lossily here since a `String` cannot carry them;
    /// [`decode_bytes`](Self::decode_bytes) returns them untouched.
    pub fn decode(&self, ids: &[i64]) -> String {
        match String::from_utf8(self.decode_bytes(ids)) {
            Ok(text) => text.trim().to_owned(),
            Err(err) => String::from_utf8_lossy(err.as_bytes()).trim().to_owned(),
        }
    }

    /// Raw reconstructed bytes for `ids`, before any UTF-8 interpretation.
    pub fn decode_bytes(&self, ids: &[i64]) -> Vec<u8> {
        let mut buffer = Vec::new();
        for id in ids {
            if self.id_to_special.contains_key(id) {
                continue;
            }
            let Some(token) = self.id_to_token.get(id) else {
                continue;
            };
            for symbol in token.chars() {
                if let Some(byte) = char_to_byte(symbol) {
                    buffer.push(byte);
                }
            }
        }
        buffer
    }

    pub fn token_to_id(&self, token: &str) -> Option<i64> {
        self.special_to_id
            .get(token)
            .or_else(|| self.vocab.get(token))
            .copied()
    }

    pub fn id_to_token(&self, id: i64) -> Option<&str> {
        self.id_to_special
            .get(&id)
            .or_else(|| self.id_to_token.get(&id))
            .map(String::as_str)
    }

    pub fn eos_id(&self) -> Option<i64> {
        self.eos_id
    }

    pub fn pad_id(&self) -> Option<i64> {
        self.pad_id
    }

    pub fn image_token_id(&self) -> Option<i64> {
        self.image_id
    }

    /// Template text declared by `tokenizer_config.json`, if any. The engine uses
    /// the fixed three-turn structure regardless; this is kept for diagnostics.
    pub fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    /// Earliest-starting special literal in `text`. Ties at the same offset go to
    /// the longest literal, which `specials_by_len` guarantees by construction.
    fn find_special<'a>(&'a self, text: &str) -> Option<(usize, &'a str)> {
        let mut best: Option<(usize, &str)> = None;
        for literal in &self.specials_by_len {
            if let Some(start) = text.find(literal.as_str()) {
                match best {
                    Some((found, _)) if start >= found => {}
                    _ => best = Some((start, literal)),
                }
            }
        }
        best
    }

    fn encode_span(&self, span: &str, ids: &mut Vec<i64>) -> Result<()> {
        if span.is_empty() {
            return Ok(());
        }
        for chunk in PRETOKENIZE.find_iter(span) {
            let chunk = chunk.map_err(|err| anyhow::anyhow!("pre-tokenization failed: {err}"))?;
            let mapped: String = chunk.as_str().bytes().map(byte_to_char).collect();
            for symbol in self.merge(&mapped) {
                ids.push(
                    self.vocab
                        .get(&symbol)
                        .copied()
                        .or(self.unk_id)
                        .unwrap_or(0),
                );
            }
        }
        Ok(())
    }

    /// Rank-driven merge loop: repeatedly fuse the adjacent pair with the lowest
    /// rank, replacing every non-overlapping occurrence left to right, until no
    /// eligible pair remains.
    fn merge(&self, mapped: &str) -> Vec<String> {
        let mut word: Vec<String> = mapped.chars().map(|c| c.to_string()).collect();
        while word.len() > 1 {
            let mut best: Option<(usize, usize)> = None;
            for i in 0..word.len() - 1 {
                let pair = (word[i].clone(), word[i + 1].clone());
                if let Some(&rank) = self.merge_ranks.get(&pair) {
                    if best.map_or(true, |(best_rank, _)| rank < best_rank) {
                        best = Some((rank, i));
                    }
                }
            }
            let Some((_, first_at)) = best else {
                break;
            };
            let first = word[first_at].clone();
            let second = word[first_at + 1].clone();
            let mut fused = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    fused.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    fused.push(word[i].clone());
                    i += 1;
                }
            }
            word = fused;
        }
        word
    }
}

fn read_resource(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|err| {
        EngineError::ResourceLoad(format!("failed to read {}: {err}", path.display())).into()
    })
}
