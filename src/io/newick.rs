use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::ScoalError;
use crate::tree::Tree;

fn read_to_string(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read {:?}", path))?;
    Ok(content)
}

/// Reads a rooted bifurcating Newick tree, gzip-transparently.
pub fn read_tree(path: &Path) -> Result<Tree> {
    let content = read_to_string(path)?;
    parse_newick(content.trim())
}

fn parse_err(position: usize, msg: impl Into<String>) -> anyhow::Error {
    ScoalError::Parse {
        position,
        msg: msg.into(),
    }
    .into()
}

struct RawNode {
    children: Vec<usize>,
    label: String,
    length: f64,
}

struct NewickParser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> NewickParser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn parse_label(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'(' | b')' | b',' | b':' | b';' | b' ' | b'\t' | b'\r' | b'\n') {
                break;
            }
            self.pos += 1;
        }
        self.src[start..self.pos].to_string()
    }

    fn parse_length(&mut self) -> Result<f64> {
        self.skip_ws();
        if self.peek() != Some(b':') {
            return Ok(0.0);
        }
        self.pos += 1;
        self.skip_ws();
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.src[start..self.pos];
        let v: f64 = text
            .parse()
            .map_err(|_| parse_err(start, format!("bad branch length '{text}'")))?;
        if !v.is_finite() || v < 0.0 {
            return Err(parse_err(start, format!("branch length {v} out of range")));
        }
        Ok(v)
    }

    fn parse_clade(&mut self) -> Result<usize> {
        self.skip_ws();
        if self.peek() == Some(b'(') {
            let open_pos = self.pos;
            self.pos += 1;
            let mut children = Vec::new();
            loop {
                children.push(self.parse_clade()?);
                self.skip_ws();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(parse_err(self.pos, "expected ',' or ')'")),
                }
            }
            if children.len() != 2 {
                return Err(parse_err(
                    open_pos,
                    format!("expected a bifurcation, found {} children", children.len()),
                ));
            }
            let label = self.parse_label();
            let length = self.parse_length()?;
            self.nodes.push(RawNode {
                children,
                label,
                length,
            });
            Ok(self.nodes.len() - 1)
        } else {
            let start = self.pos;
            let label = self.parse_label();
            if label.is_empty() {
                return Err(parse_err(start, "expected a tip label"));
            }
            let length = self.parse_length()?;
            self.nodes.push(RawNode {
                children: Vec::new(),
                label,
                length,
            });
            Ok(self.nodes.len() - 1)
        }
    }
}

pub fn parse_newick(src: &str) -> Result<Tree> {
    let mut parser = NewickParser {
        src,
        bytes: src.as_bytes(),
        pos: 0,
        nodes: Vec::new(),
    };
    let raw_root = parser.parse_clade()?;
    parser.skip_ws();
    if parser.peek() == Some(b';') {
        parser.pos += 1;
        parser.skip_ws();
    }
    if parser.pos != src.len() {
        return Err(parse_err(parser.pos, "trailing characters after tree"));
    }

    let raw = parser.nodes;
    let n_tips = raw.iter().filter(|n| n.children.is_empty()).count();
    if n_tips < 2 {
        return Err(parse_err(0, "tree needs at least two tips"));
    }

    // tips take ids 0..n_tips in raw (left-to-right) order, internals follow
    let mut id_of = vec![usize::MAX; raw.len()];
    let mut next_tip = 0usize;
    let mut next_internal = n_tips;
    for (i, node) in raw.iter().enumerate() {
        if node.children.is_empty() {
            id_of[i] = next_tip;
            next_tip += 1;
        } else {
            id_of[i] = next_internal;
            next_internal += 1;
        }
    }

    let n_nodes = raw.len();
    let mut parent = vec![-1i32; n_nodes];
    let mut depth = vec![0.0f64; n_nodes];
    let mut tip_names = vec![String::new(); n_tips];
    let mut stack = vec![raw_root];
    while let Some(ri) = stack.pop() {
        let id = id_of[ri];
        if raw[ri].children.is_empty() {
            tip_names[id] = raw[ri].label.clone();
        }
        for &ci in &raw[ri].children {
            parent[id_of[ci]] = id as i32;
            depth[id_of[ci]] = depth[id] + raw[ci].length;
            stack.push(ci);
        }
    }

    let max_depth = (0..n_nodes)
        .filter(|&i| raw[i].children.is_empty())
        .map(|i| depth[id_of[i]])
        .fold(0.0f64, f64::max);
    let mut height = vec![0.0f64; n_nodes];
    for (ri, node) in raw.iter().enumerate() {
        let h = max_depth - depth[id_of[ri]];
        // tolerate float residue on the youngest tips
        height[id_of[ri]] = if node.children.is_empty() && h.abs() < 1e-9 {
            0.0
        } else {
            h
        };
    }

    {
        let mut seen = tip_names.to_vec();
        seen.sort();
        seen.dedup();
        if seen.len() != n_tips {
            return Err(ScoalError::Config("duplicate tip labels in tree".to_string()).into());
        }
    }

    Tree::from_parts(parent, height, n_tips, tip_names)
}
