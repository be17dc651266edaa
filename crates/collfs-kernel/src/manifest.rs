//! Manifest text codec.
//!
//! A manifest is the durable description of a collection. Each line is a
//! stream: a directory path, the blocks whose concatenation forms the
//! stream's data, and file tokens addressing byte ranges of that data.
//!
//! ```text
//! . 3858f62230ac3c915f300c664312c63f3858f62230ac3c915f300c664312c63f+6 0:3:foo 3:3:bar
//! ./sub\040dir 3858f622...+6 0:6:foobar
//! ./empty d41d8cd9...+0 0:0:\056
//! ```
//!
//! Stream and file names escape space, tab, newline, backslash and other
//! control bytes as `\ooo` octal. A file may appear in several tokens,
//! which are concatenated in order. An empty directory is a stream with
//! the empty block and a `0:0:\056` token.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use collfs_keep::Locator;
use thiserror::Error;

use crate::collection::node::Segment;
use crate::snapshot::SnapNode;

/// Token standing for the directory itself.
const DIR_MARKER: &str = ".";

/// Manifest parse or build failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("manifest line {line}: {message}")]
pub struct ManifestError {
    /// 1-based line number, 0 when not tied to a line.
    pub line: usize,
    pub message: String,
}

impl ManifestError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

pub type ManifestResult<T> = Result<T, ManifestError>;

/// One `pos:len:name` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileToken {
    pub pos: u64,
    pub len: u64,
    /// Unescaped name, possibly containing `/`.
    pub name: String,
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    /// Unescaped stream path: `.` or `./a/b`.
    pub name: String,
    pub locators: Vec<Locator>,
    pub files: Vec<FileToken>,
}

impl Stream {
    /// Total bytes of the stream's blocks.
    pub fn data_size(&self) -> u64 {
        self.locators.iter().map(Locator::size).sum()
    }

    /// Directory components below the collection root.
    fn dir_components(&self, line: usize) -> ManifestResult<Vec<String>> {
        let rest = if self.name == "." {
            ""
        } else if let Some(rest) = self.name.strip_prefix("./") {
            rest
        } else {
            return Err(ManifestError::new(
                line,
                format!("stream name {:?} must be . or start with ./", self.name),
            ));
        };
        split_name(rest, line, true)
    }
}

/// Per-file sizes and total data size.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestStats {
    /// Sum of the sizes of every locator token, repeats included.
    pub data_size: u64,
    /// (stream, file name, size) in order of first appearance.
    pub files: Vec<(String, String, u64)>,
}

/// A parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    streams: Vec<Stream>,
}

impl Manifest {
    pub fn parse(text: &str) -> ManifestResult<Self> {
        let mut streams = Vec::new();
        let body = text.strip_suffix('\n').unwrap_or(text);
        if body.is_empty() {
            return Ok(Self::default());
        }
        for (i, line) in body.split('\n').enumerate() {
            streams.push(parse_stream(line, i + 1)?);
        }
        Ok(Self { streams })
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Every locator token, in order.
    pub fn locators(&self) -> impl Iterator<Item = &Locator> {
        self.streams.iter().flat_map(|s| s.locators.iter())
    }

    /// Same manifest with all signatures removed.
    pub fn strip_signatures(&self) -> Manifest {
        let mut out = self.clone();
        for stream in &mut out.streams {
            for loc in &mut stream.locators {
                *loc = loc.unsigned();
            }
        }
        out
    }

    /// Content identity of this manifest.
    pub fn portable_data_hash(&self) -> String {
        collfs_keep::portable_data_hash(&self.to_string())
    }

    /// Data size and per-file sizes.
    pub fn inspect(&self) -> ManifestStats {
        let mut stats = ManifestStats::default();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for stream in &self.streams {
            stats.data_size += stream.data_size();
            for f in &stream.files {
                let key = (stream.name.clone(), f.name.clone());
                match index.get(&key) {
                    Some(&i) => stats.files[i].2 += f.len,
                    None => {
                        index.insert(key, stats.files.len());
                        stats.files.push((stream.name.clone(), f.name.clone(), f.len));
                    }
                }
            }
        }
        stats
    }

    /// Build the directory tree described by this manifest.
    pub fn to_snapshot(&self, mtime: SystemTime) -> ManifestResult<SnapNode> {
        let mut root = SnapNode::empty_dir(mtime);
        for (i, stream) in self.streams.iter().enumerate() {
            let line = i + 1;
            let dir = stream.dir_components(line)?;
            let mut starts = Vec::with_capacity(stream.locators.len());
            let mut total = 0u64;
            for loc in &stream.locators {
                starts.push(total);
                total += loc.size();
            }
            ensure_dir(&mut root, &dir, mtime, line)?;

            for token in &stream.files {
                if token.name == DIR_MARKER {
                    if token.len != 0 {
                        return Err(ManifestError::new(line, "directory marker with data"));
                    }
                    continue;
                }
                let mut path = dir.clone();
                path.extend(split_name(&token.name, line, false)?);
                let segments = resolve_range(&stream.locators, &starts, token.pos, token.len);
                let (name, parent) = path
                    .split_last()
                    .ok_or_else(|| ManifestError::new(line, "empty file name"))?;
                let parent = ensure_dir(&mut root, parent, mtime, line)?;
                match parent.entry(name.clone()).or_insert_with(|| SnapNode::File {
                    segments: Vec::new(),
                    mtime,
                }) {
                    SnapNode::File { segments: existing, .. } => existing.extend(segments),
                    SnapNode::Dir { .. } => {
                        return Err(ManifestError::new(
                            line,
                            format!("{:?} is both a file and a directory", token.name),
                        ));
                    }
                }
            }
        }
        Ok(root)
    }

    /// Serialize a tree. Every file segment must already be stored.
    pub fn from_snapshot(root: &SnapNode) -> ManifestResult<Manifest> {
        let mut streams = Vec::new();
        match root {
            SnapNode::Dir { children, .. } => {
                collect_streams(".", children, true, &mut streams)?;
            }
            SnapNode::File { .. } => {
                return Err(ManifestError::new(0, "collection root must be a directory"));
            }
        }
        Ok(Manifest { streams })
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stream in &self.streams {
            f.write_str(&escape(&stream.name))?;
            for loc in &stream.locators {
                write!(f, " {}", loc)?;
            }
            for file in &stream.files {
                let name = if file.name == DIR_MARKER {
                    "\\056".to_string()
                } else {
                    escape(&file.name)
                };
                write!(f, " {}:{}:{}", file.pos, file.len, name)?;
            }
            f.write_str("\n")?;
        }
        Ok(())
    }
}

impl FromStr for Manifest {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_stream(line: &str, lineno: usize) -> ManifestResult<Stream> {
    let mut tokens = line.split(' ');
    let name = tokens
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ManifestError::new(lineno, "empty line"))?;
    let name = unescape(name, lineno)?;

    let mut locators = Vec::new();
    let mut files = Vec::new();
    for token in tokens {
        if files.is_empty() {
            if let Ok(loc) = token.parse::<Locator>() {
                locators.push(loc);
                continue;
            }
        }
        files.push(parse_file_token(token, lineno)?);
    }

    if locators.is_empty() {
        return Err(ManifestError::new(lineno, "stream has no locators"));
    }
    if files.is_empty() {
        return Err(ManifestError::new(lineno, "stream has no file tokens"));
    }
    let stream = Stream {
        name,
        locators,
        files,
    };
    let size = stream.data_size();
    for f in &stream.files {
        if f.pos.checked_add(f.len).is_none_or(|end| end > size) {
            return Err(ManifestError::new(
                lineno,
                format!("file token {}:{} past end of stream ({} bytes)", f.pos, f.len, size),
            ));
        }
    }
    Ok(stream)
}

fn parse_file_token(token: &str, lineno: usize) -> ManifestResult<FileToken> {
    let bad = || ManifestError::new(lineno, format!("invalid token {:?}", token));
    let mut parts = token.splitn(3, ':');
    let pos = parts.next().ok_or_else(bad)?;
    let len = parts.next().ok_or_else(bad)?;
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(bad)?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(pos) || !digits(len) {
        return Err(bad());
    }
    Ok(FileToken {
        pos: pos.parse().map_err(|_| bad())?,
        len: len.parse().map_err(|_| bad())?,
        name: unescape(name, lineno)?,
    })
}

/// Split a `/`-separated name, rejecting `..` and empty parts. `.` parts
/// are rejected in file names but allowed (ignored) nowhere else.
fn split_name(name: &str, line: usize, allow_empty: bool) -> ManifestResult<Vec<String>> {
    if name.is_empty() {
        return if allow_empty {
            Ok(Vec::new())
        } else {
            Err(ManifestError::new(line, "empty name"))
        };
    }
    name.split('/')
        .map(|part| match part {
            "" | "." | ".." => Err(ManifestError::new(
                line,
                format!("invalid path component in {:?}", name),
            )),
            p => Ok(p.to_string()),
        })
        .collect()
}

/// Stored segments covering `[pos, pos + len)` of a stream.
fn resolve_range(locators: &[Locator], starts: &[u64], pos: u64, len: u64) -> Vec<Segment> {
    let end = pos + len;
    let mut out = Vec::new();
    for (loc, &start) in locators.iter().zip(starts) {
        let block_end = start + loc.size();
        if block_end <= pos || loc.size() == 0 {
            continue;
        }
        if start >= end {
            break;
        }
        let from = pos.max(start);
        let to = end.min(block_end);
        out.push(Segment::Stored {
            locator: loc.clone(),
            offset: from - start,
            len: to - from,
        });
    }
    out
}

fn ensure_dir<'a>(
    root: &'a mut SnapNode,
    comps: &[String],
    mtime: SystemTime,
    line: usize,
) -> ManifestResult<&'a mut BTreeMap<String, SnapNode>> {
    let mut node = root;
    for name in comps {
        let children = match node {
            SnapNode::Dir { children, .. } => children,
            SnapNode::File { .. } => unreachable!("ensure_dir only descends into directories"),
        };
        node = children
            .entry(name.clone())
            .or_insert_with(|| SnapNode::empty_dir(mtime));
        if !node.is_dir() {
            return Err(ManifestError::new(
                line,
                format!("{:?} is both a file and a directory", name),
            ));
        }
    }
    match node {
        SnapNode::Dir { children, .. } => Ok(children),
        SnapNode::File { .. } => Err(ManifestError::new(line, "root is not a directory")),
    }
}

fn collect_streams(
    name: &str,
    children: &BTreeMap<String, SnapNode>,
    is_root: bool,
    streams: &mut Vec<Stream>,
) -> ManifestResult<()> {
    let mut locators: Vec<Locator> = Vec::new();
    let mut starts: HashMap<Locator, u64> = HashMap::new();
    let mut total = 0u64;
    let mut files: Vec<FileToken> = Vec::new();

    for (fname, node) in children {
        let SnapNode::File { segments, .. } = node else {
            continue;
        };
        let mut tokens: Vec<FileToken> = Vec::new();
        for seg in segments {
            let Segment::Stored {
                locator,
                offset,
                len,
            } = seg
            else {
                return Err(ManifestError::new(
                    0,
                    format!("{}/{} has data that is not stored yet", name, fname),
                ));
            };
            let key = locator.unsigned();
            let start = match starts.get(&key) {
                Some(&s) => s,
                None => {
                    starts.insert(key, total);
                    locators.push(locator.clone());
                    total += locator.size();
                    total - locator.size()
                }
            };
            let pos = start + offset;
            match tokens.last_mut() {
                Some(prev) if prev.pos + prev.len == pos => prev.len += len,
                _ => tokens.push(FileToken {
                    pos,
                    len: *len,
                    name: fname.clone(),
                }),
            }
        }
        if tokens.is_empty() {
            tokens.push(FileToken {
                pos: 0,
                len: 0,
                name: fname.clone(),
            });
        }
        files.extend(tokens);
    }

    if files.is_empty() && children.is_empty() && !is_root {
        files.push(FileToken {
            pos: 0,
            len: 0,
            name: DIR_MARKER.to_string(),
        });
    }
    if !files.is_empty() {
        if locators.is_empty() {
            locators.push(Locator::empty());
        }
        streams.push(Stream {
            name: name.to_string(),
            locators,
            files,
        });
    }

    for (dname, node) in children {
        if let SnapNode::Dir { children, .. } = node {
            collect_streams(&format!("{}/{}", name, dname), children, false, streams)?;
        }
    }
    Ok(())
}

/// Escape a name for manifest text.
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '\\' || (c.is_ascii() && (c as u8 <= 0x20 || c as u8 == 0x7f)) {
            out.push_str(&format!("\\{:03o}", c as u8));
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse [`escape`]. Accepts `\ooo` and `\\`.
pub fn unescape(text: &str, line: usize) -> ManifestResult<String> {
    if !text.contains('\\') {
        return Ok(text.to_string());
    }
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
            continue;
        }
        let octal = bytes
            .get(i + 1..i + 4)
            .filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)))
            .ok_or_else(|| ManifestError::new(line, format!("bad escape in {:?}", text)))?;
        let value = octal
            .iter()
            .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
        let byte = u8::try_from(value)
            .map_err(|_| ManifestError::new(line, format!("bad escape in {:?}", text)))?;
        out.push(byte);
        i += 4;
    }
    String::from_utf8(out).map_err(|_| ManifestError::new(line, format!("{:?} is not UTF-8", text)))
}
