//! Inspect a dumped word-lattice file: summary statistics and optional
//! node/edge listings. Works directly on the text exchange format, no
//! models required.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    /// Lattice file produced by the decoder's dump.
    lattice: PathBuf,

    /// Print every node.
    #[arg(long)]
    nodes: bool,

    /// Print every edge.
    #[arg(long)]
    edges: bool,

    /// Show the N widest-spanning nodes.
    #[arg(long, default_value_t = 0)]
    top: usize,
}

struct Node {
    word: String,
    sf: i32,
    fef: i32,
    lef: i32,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file = File::open(&args.lattice)
        .with_context(|| format!("open {}", args.lattice.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut next = || -> Result<String> {
        lines
            .next()
            .context("unexpected end of file")?
            .context("read line")
    };

    let frames: i32 = next()?
        .strip_prefix("Frames ")
        .context("missing Frames header")?
        .trim()
        .parse()?;
    let n_nodes: usize = next()?
        .strip_prefix("Nodes ")
        .and_then(|s| s.split_whitespace().next())
        .context("missing Nodes header")?
        .parse()?;

    let mut nodes = Vec::with_capacity(n_nodes);
    for _ in 0..n_nodes {
        let line = next()?;
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() != 5 {
            bail!("malformed node line: {line}");
        }
        nodes.push(Node {
            word: f[1].to_string(),
            sf: f[2].parse()?,
            fef: f[3].parse()?,
            lef: f[4].parse()?,
        });
    }

    let initial: usize = next()?
        .strip_prefix("Initial ")
        .context("missing Initial")?
        .trim()
        .parse()?;
    let final_id: usize = next()?
        .strip_prefix("Final ")
        .context("missing Final")?
        .trim()
        .parse()?;
    let final_ascr: i64 = next()?
        .strip_prefix("FinalAscr ")
        .context("missing FinalAscr")?
        .trim()
        .parse()?;

    let header = next()?;
    if !header.starts_with("Edges") {
        bail!("missing Edges header");
    }
    let mut edges: Vec<(usize, usize, i64)> = Vec::new();
    loop {
        let line = next()?;
        if line.trim() == "End" {
            break;
        }
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() != 3 {
            bail!("malformed edge line: {line}");
        }
        edges.push((f[0].parse()?, f[1].parse()?, f[2].parse()?));
    }

    println!("{}", args.lattice.display());
    println!("  frames:  {frames}");
    println!("  nodes:   {}", nodes.len());
    println!("  edges:   {}", edges.len());
    println!(
        "  initial: {} ({} @{})",
        initial, nodes[initial].word, nodes[initial].sf
    );
    println!(
        "  final:   {} ({} @{}, ascr {})",
        final_id, nodes[final_id].word, nodes[final_id].sf, final_ascr
    );

    let mut out_deg: HashMap<usize, usize> = HashMap::new();
    for &(from, _, _) in &edges {
        *out_deg.entry(from).or_insert(0) += 1;
    }
    let dead_ends = nodes
        .len()
        .saturating_sub(out_deg.len())
        .saturating_sub(1); // the final node has no successors
    println!("  nodes without successors (besides final): {dead_ends}");

    if args.nodes {
        println!("nodes:");
        for (i, n) in nodes.iter().enumerate() {
            println!("  {i:5} {:20} sf {:5} ef {:5}..{:5}", n.word, n.sf, n.fef, n.lef);
        }
    }
    if args.edges {
        println!("edges:");
        for &(from, to, ascr) in &edges {
            println!(
                "  {:20} @{:<5} -> {:20} @{:<5} {ascr}",
                nodes[from].word, nodes[from].sf, nodes[to].word, nodes[to].sf
            );
        }
    }
    if args.top > 0 {
        let mut spans: Vec<(i32, usize)> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.lef - n.fef, i))
            .collect();
        spans.sort_by_key(|&(s, _)| std::cmp::Reverse(s));
        println!("widest end-frame spans:");
        for &(span, i) in spans.iter().take(args.top) {
            println!("  {:20} sf {:5} span {}", nodes[i].word, nodes[i].sf, span);
        }
    }
    Ok(())
}
