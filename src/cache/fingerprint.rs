//! The source text a cached module was compiled from.
//!
//! A module has no free variables, so identical source text from the
//! start of the module function through its closing brace means identical
//! code, given the same machine. Modules built with a function constructor
//! carry their formals outside the text; those are recorded explicitly
//! and their text must run to the end of the source.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use super::codec::{Reader, read_name, write_name};
use crate::error::CacheError;
use crate::module::tables::Name;

/// The script a module is being compiled from.
#[derive(Debug, Clone, Copy)]
pub struct ScriptSource<'a> {
    pub filename: &'a str,
    pub text: &'a [u8],
    /// Formal parameter names when the module body came from a function
    /// constructor.
    pub fun_ctor_args: Option<&'a [String]>,
}

impl<'a> ScriptSource<'a> {
    pub fn new(filename: &'a str, text: &'a [u8]) -> Self {
        Self {
            filename,
            text,
            fun_ctor_args: None,
        }
    }

    pub fn with_fun_ctor_args(mut self, args: &'a [String]) -> Self {
        self.fun_ctor_args = Some(args);
        self
    }
}

/// Source fingerprint as stored in a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleChars {
    chars: Vec<u8>,
    fun_ctor_args: Option<Vec<Name>>,
}

impl ModuleChars {
    /// Capture `source.text[begin..end]`.
    pub fn for_store(source: &ScriptSource<'_>, begin: u32, end: u32) -> Option<Self> {
        let (begin, end) = (begin as usize, end as usize);
        if begin >= end || end > source.text.len() {
            return None;
        }
        Some(Self {
            chars: source.text[begin..end].to_vec(),
            fun_ctor_args: source
                .fun_ctor_args
                .map(|args| args.iter().map(|a| Name::new(a.as_str())).collect()),
        })
    }

    /// Number of source bytes covered.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Whether the module starting at `begin` in `source` is the one these
    /// chars were captured from.
    pub fn matches(&self, source: &ScriptSource<'_>, begin: u32) -> bool {
        let Some(rest) = source.text.get(begin as usize..) else {
            return false;
        };
        if rest.len() < self.chars.len() || rest[..self.chars.len()] != self.chars[..] {
            return false;
        }
        match (&self.fun_ctor_args, source.fun_ctor_args) {
            (None, None) => true,
            (Some(stored), Some(args)) => {
                // A function statement ends at its closing brace, which is
                // part of the chars. A constructor body ends at the end of
                // the source, so a longer body must not match.
                rest.len() == self.chars.len()
                    && stored.len() == args.len()
                    && stored.iter().zip(args).all(|(a, b)| a.as_str() == b)
            }
            _ => false,
        }
    }

    pub(crate) fn write<W: Write>(&self, w: &mut W) -> Result<(), CacheError> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&self.chars)
            .map_err(|_| CacheError::Compression)?;
        let compressed = encoder.finish().map_err(|_| CacheError::Compression)?;
        let compressed_len = u32::try_from(compressed.len()).map_err(|_| CacheError::Compression)?;

        w.write_u32::<LittleEndian>(self.chars.len() as u32)?;
        w.write_u32::<LittleEndian>(compressed_len)?;
        w.write_all(&compressed)?;
        w.write_u32::<LittleEndian>(self.fun_ctor_args.is_some() as u32)?;
        if let Some(args) = &self.fun_ctor_args {
            write_names(w, args)?;
        }
        Ok(())
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, CacheError> {
        let uncompressed_len = r.u32()? as usize;
        let compressed_len = r.count(1)?;
        let compressed = r.bytes(compressed_len)?;

        let mut chars = Vec::with_capacity(uncompressed_len.min(compressed_len.saturating_mul(64)));
        DeflateDecoder::new(&compressed[..])
            .take(uncompressed_len as u64 + 1)
            .read_to_end(&mut chars)
            .map_err(|_| CacheError::Corrupt("source fingerprint does not inflate"))?;
        if chars.len() != uncompressed_len {
            return Err(CacheError::Corrupt("source fingerprint length mismatch"));
        }

        let fun_ctor_args = match r.u32()? {
            0 => None,
            1 => {
                let n = r.count(4)?;
                let mut args = Vec::with_capacity(n);
                for _ in 0..n {
                    args.push(read_name(r)?.ok_or(CacheError::Corrupt("missing formal name"))?);
                }
                Some(args)
            }
            _ => return Err(CacheError::Corrupt("bad function constructor flag")),
        };
        Ok(Self {
            chars,
            fun_ctor_args,
        })
    }
}

fn write_names<W: Write>(w: &mut W, names: &[Name]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(names.len() as u32)?;
    for name in names {
        write_name(w, Some(name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &[u8] = b"var x; function m(stdlib) { \"use asm\"; function f() {} return f } m();";

    fn module_end() -> u32 {
        TEXT.iter().position(|&c| c == b'}').map(|p| p as u32).unwrap() + 12
    }

    #[test]
    fn test_statement_match() {
        let source = ScriptSource::new("a.js", TEXT);
        let begin = 7;
        let chars = ModuleChars::for_store(&source, begin, module_end()).unwrap();
        assert!(chars.matches(&source, begin));
        assert!(!chars.matches(&source, begin + 1));

        // Trailing text after the module is irrelevant.
        let mut longer = TEXT.to_vec();
        longer.extend_from_slice(b" more();");
        assert!(chars.matches(&ScriptSource::new("a.js", &longer), begin));

        // One changed byte inside the module misses.
        let mut changed = TEXT.to_vec();
        changed[20] ^= 1;
        assert!(!chars.matches(&ScriptSource::new("a.js", &changed), begin));

        // Truncated source misses.
        assert!(!chars.matches(&ScriptSource::new("a.js", &TEXT[..20]), begin));
    }

    #[test]
    fn test_fun_ctor_requires_exact_end_and_args() {
        let body = b"\"use asm\"; function f() {} return f";
        let args = vec!["stdlib".to_string()];
        let source = ScriptSource::new("ctor", body).with_fun_ctor_args(&args);
        let chars = ModuleChars::for_store(&source, 0, body.len() as u32).unwrap();
        assert!(chars.matches(&source, 0));

        let longer = b"\"use asm\"; function f() {} return ff";
        assert!(!chars.matches(&ScriptSource::new("ctor", longer).with_fun_ctor_args(&args), 0));

        let other_args = vec!["glob".to_string()];
        assert!(!chars.matches(&ScriptSource::new("ctor", body).with_fun_ctor_args(&other_args), 0));
        assert!(!chars.matches(&ScriptSource::new("ctor", body), 0));
    }

    #[test]
    fn test_compressed_encoding() {
        let args = vec!["a".to_string(), "\u{3b2}".to_string()];
        let text = b"function m() { return 0 } ".repeat(20);
        let source = ScriptSource::new("x", &text).with_fun_ctor_args(&args);
        let chars = ModuleChars::for_store(&source, 0, text.len() as u32).unwrap();
        let mut buf = Vec::new();
        chars.write(&mut buf).unwrap();
        assert!(buf.len() < text.len());
        let mut r = Reader::new(&buf);
        assert_eq!(ModuleChars::read(&mut r).unwrap(), chars);
        assert!(r.is_at_end());
    }

    #[test]
    fn test_bad_compressed_data_is_corrupt() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(10).unwrap();
        buf.write_u32::<LittleEndian>(3).unwrap();
        buf.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        buf.write_u32::<LittleEndian>(0).unwrap();
        assert!(matches!(
            ModuleChars::read(&mut Reader::new(&buf)),
            Err(CacheError::Corrupt(_))
        ));
    }

    #[test]
    fn test_empty_range_is_not_stored() {
        let source = ScriptSource::new("a.js", TEXT);
        assert!(ModuleChars::for_store(&source, 5, 5).is_none());
        assert!(ModuleChars::for_store(&source, 0, TEXT.len() as u32 + 1).is_none());
    }
}
