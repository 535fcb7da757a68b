//! Integrates the branches produced by one group into the main line.
//!
//! Every path touched by more than one branch is a conflict region. The
//! resolver classifies each region, auto-resolves what is provably safe and
//! turns everything else into an `Escalation` that waits for a decision.
//!
//! Additive regions (every branch only inserts lines into an existing file)
//! are merged commutatively: each inserted hunk is kept whole as a block,
//! and the blocks at one base anchor are ordered lexically with identical
//! blocks kept once. Anything else, including a file created differently
//! by several branches, is merged pairwise in ascending complexity so the
//! cheapest branch sets the baseline.

use git2::{DiffOptions, Patch};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::context::{ChangeSet, Snapshot};
use crate::core::TaskId;
use crate::orchestration::escalation::{Escalation, ResolutionChoice, ResolutionOption};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// Lines of context in diffs shown to a decision-maker.
const DIFF_CONTEXT: u32 = 3;

/// The sealed output of one execution context.
#[derive(Debug, Clone)]
pub struct BranchResult {
    pub tasks: Vec<TaskId>,
    pub branch: String,
    /// Highest complexity among the branch's tasks.
    pub complexity: u8,
    pub changes: ChangeSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictClass {
    Additive,
    OverlappingNonSemantic,
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    AutoResolved { strategy: String },
    Escalated,
    UserResolved { choice: ResolutionChoice },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub path: PathBuf,
    pub branches: Vec<String>,
    pub tasks: Vec<TaskId>,
    pub classification: ConflictClass,
    pub resolution: Resolution,
}

impl ConflictRecord {
    pub fn is_unresolved(&self) -> bool {
        self.resolution == Resolution::Escalated
    }
}

impl std::fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolution = match &self.resolution {
            Resolution::AutoResolved { strategy } => format!("auto: {}", strategy),
            Resolution::Escalated => "escalated".to_string(),
            Resolution::UserResolved { choice } => format!("resolved: {}", choice),
        };
        write!(
            f,
            "{} {:?} {} [{}]",
            self.path.display(),
            self.classification,
            resolution,
            self.branches.join(", ")
        )
    }
}

/// Result of integrating one group.
#[derive(Debug, Default)]
pub struct Integration {
    /// Final content of every touched path.
    pub merged: ChangeSet,
    pub records: Vec<ConflictRecord>,
    pub escalations: Vec<Escalation>,
}

/// Content to write after a decision, and whether it had to be rebased onto
/// a main line that moved since the escalation was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChoice {
    pub content: Option<String>,
    pub rebased: bool,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Ours,
    Theirs,
}

/// Which side goes first when both sides of a clash are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnionOrder {
    OursFirst,
    TheirsFirst,
}

#[derive(Debug, Clone)]
struct Edit {
    /// Index of the first replaced base line.
    start: usize,
    /// One past the last replaced base line; equal to `start` for inserts.
    end: usize,
    lines: Vec<String>,
}

enum PairMerge {
    /// One side unchanged or both identical.
    Trivial(Option<String>),
    Merged(Option<String>, &'static str),
    Conflict,
}

pub struct ConflictResolver {
    whitespace: Regex,
}

impl ConflictResolver {
    pub fn new() -> Result<Self> {
        let whitespace =
            Regex::new(r"\s+").map_err(|e| Error::Validation(format!("whitespace regex: {}", e)))?;
        Ok(Self { whitespace })
    }

    /// Merge every branch into `main`, the pre-group content of the paths
    /// the branches touched.
    pub fn integrate(&self, main: &Snapshot, mut branches: Vec<BranchResult>) -> Result<Integration> {
        branches.sort_by(|a, b| (a.complexity, &a.branch).cmp(&(b.complexity, &b.branch)));

        let paths: BTreeSet<PathBuf> = branches
            .iter()
            .flat_map(|b| b.changes.keys().cloned())
            .collect();

        let mut integration = Integration::default();
        for path in paths {
            let base = main.get(&path).cloned().flatten();
            let touching: Vec<(&BranchResult, Option<String>)> = branches
                .iter()
                .filter_map(|b| b.changes.get(&path).map(|v| (b, v.clone())))
                .collect();

            if touching.len() == 1 || touching.windows(2).all(|w| w[0].1 == w[1].1) {
                integration.merged.insert(path, touching[0].1.clone());
                continue;
            }

            let record_id = Uuid::new_v4().to_string();
            let versions: Vec<Option<String>> = touching.iter().map(|(_, v)| v.clone()).collect();

            // Competing creations of a new file are not insertions into anything.
            let additive = match base.as_deref() {
                Some(base_text) => self.additive_union(base_text, &versions)?,
                None => None,
            };
            let (content, classification, resolution) =
                if let Some(union) = additive {
                    (
                        Some(union),
                        ConflictClass::Additive,
                        Resolution::AutoResolved {
                            strategy: "union of insertions".to_string(),
                        },
                    )
                } else {
                    let (content, strategies, escalations) =
                        self.merge_pairwise(&path, &record_id, base.as_ref(), &touching)?;
                    if escalations.is_empty() {
                        let strategy = if strategies.is_empty() {
                            "identical edits".to_string()
                        } else {
                            strategies.into_iter().collect::<Vec<_>>().join(" + ")
                        };
                        (
                            content,
                            ConflictClass::OverlappingNonSemantic,
                            Resolution::AutoResolved { strategy },
                        )
                    } else {
                        integration.escalations.extend(escalations);
                        (content, ConflictClass::Semantic, Resolution::Escalated)
                    }
                };

            let mut tasks: Vec<TaskId> = touching
                .iter()
                .flat_map(|(b, _)| b.tasks.iter().cloned())
                .collect();
            tasks.sort();
            tasks.dedup();
            let record = ConflictRecord {
                id: record_id,
                path: path.clone(),
                branches: touching.iter().map(|(b, _)| b.branch.clone()).collect(),
                tasks,
                classification,
                resolution,
            };
            rlog!("Conflict: {}", record);
            integration.records.push(record);
            integration.merged.insert(path, content);
        }
        Ok(integration)
    }

    /// Content for `choice`, rebased onto `current` when the main line
    /// changed the path after the escalation was raised.
    pub fn apply_choice(
        &self,
        escalation: &Escalation,
        choice: ResolutionChoice,
        current: Option<&str>,
    ) -> Result<AppliedChoice> {
        let option = escalation.option(choice).ok_or_else(|| {
            Error::Validation(format!(
                "option {} not offered for {}",
                choice,
                escalation.path.display()
            ))
        })?;
        if current == escalation.baseline.as_deref() {
            return Ok(AppliedChoice {
                content: option.content.clone(),
                rebased: false,
                warning: None,
            });
        }

        let current = current.map(str::to_string);
        match self.merge_pair(escalation.baseline.as_ref(), &current, &option.content)? {
            PairMerge::Trivial(content) | PairMerge::Merged(content, _) => Ok(AppliedChoice {
                content,
                rebased: true,
                warning: None,
            }),
            PairMerge::Conflict => {
                let warning = format!(
                    "{} changed since escalation {}; {} overrides the newer content",
                    escalation.path.display(),
                    escalation.id,
                    choice
                );
                rlog_warn!("{}", warning);
                Ok(AppliedChoice {
                    content: option.content.clone(),
                    rebased: false,
                    warning: Some(warning),
                })
            }
        }
    }

    fn merge_pairwise(
        &self,
        path: &Path,
        record_id: &str,
        base: Option<&String>,
        touching: &[(&BranchResult, Option<String>)],
    ) -> Result<(Option<String>, BTreeSet<&'static str>, Vec<Escalation>)> {
        let mut acc = touching[0].1.clone();
        let mut acc_tasks = touching[0].0.tasks.clone();
        let mut strategies = BTreeSet::new();
        let mut escalations = Vec::new();

        for (branch, version) in &touching[1..] {
            match self.merge_pair(base, &acc, version)? {
                PairMerge::Trivial(content) => {
                    acc = content;
                    acc_tasks.extend(branch.tasks.iter().cloned());
                }
                PairMerge::Merged(content, strategy) => {
                    acc = content;
                    acc_tasks.extend(branch.tasks.iter().cloned());
                    strategies.insert(strategy);
                }
                PairMerge::Conflict => {
                    rlog_debug!(
                        "Semantic conflict on {}: baseline {:?} vs {}",
                        path.display(),
                        acc_tasks,
                        branch.branch
                    );
                    escalations.push(self.escalation(
                        path,
                        record_id,
                        base,
                        (&acc_tasks, &acc),
                        (&branch.tasks, version),
                    )?);
                }
            }
        }
        Ok((acc, strategies, escalations))
    }

    fn merge_pair(
        &self,
        base: Option<&String>,
        ours: &Option<String>,
        theirs: &Option<String>,
    ) -> Result<PairMerge> {
        if ours == theirs || theirs.as_ref() == base {
            return Ok(PairMerge::Trivial(ours.clone()));
        }
        if ours.as_ref() == base {
            return Ok(PairMerge::Trivial(theirs.clone()));
        }
        let (Some(ours_text), Some(theirs_text)) = (ours, theirs) else {
            return Ok(PairMerge::Conflict);
        };
        let base_text = base.map(String::as_str).unwrap_or("");
        if let Some(merged) = merge3(base_text, ours_text, theirs_text, None)? {
            return Ok(PairMerge::Merged(Some(merged), "three-way line merge"));
        }
        if self.normalize(ours_text) == self.normalize(theirs_text) {
            return Ok(PairMerge::Merged(
                ours.clone(),
                "whitespace-only divergence",
            ));
        }
        Ok(PairMerge::Conflict)
    }

    fn normalize(&self, text: &str) -> String {
        self.whitespace.replace_all(text.trim(), " ").into_owned()
    }

    /// Union of inserted blocks, or `None` when some branch does more than
    /// insert.
    fn additive_union(&self, base_text: &str, versions: &[Option<String>]) -> Result<Option<String>> {
        let mut anchors: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for version in versions {
            let Some(text) = version else {
                return Ok(None);
            };
            let edits = line_edits(base_text, text)?;
            if edits.iter().any(|e| e.start != e.end) {
                return Ok(None);
            }
            for edit in edits {
                let mut block = edit
                    .lines
                    .iter()
                    .map(|l| strip_eol(l))
                    .collect::<Vec<_>>()
                    .join("\n");
                block.push('\n');
                anchors.entry(edit.start).or_default().insert(block);
            }
        }

        let base_lines: Vec<&str> = base_text.split_inclusive('\n').collect();
        let mut out = String::new();
        for i in 0..=base_lines.len() {
            if let Some(blocks) = anchors.get(&i) {
                for block in blocks {
                    out.push_str(block);
                }
            }
            if let Some(line) = base_lines.get(i) {
                out.push_str(line);
            }
        }
        let keeps_eol = versions.iter().flatten().any(|v| v.ends_with('\n'));
        if !keeps_eol && out.ends_with('\n') {
            out.pop();
        }
        Ok(Some(out))
    }

    fn escalation(
        &self,
        path: &Path,
        record_id: &str,
        base: Option<&String>,
        baseline: (&[TaskId], &Option<String>),
        incoming: (&[TaskId], &Option<String>),
    ) -> Result<Escalation> {
        let base_text = base.map(String::as_str).unwrap_or("");
        let (baseline_tasks, baseline_content) = baseline;
        let (incoming_tasks, incoming_content) = incoming;

        let mut options = vec![
            ResolutionOption {
                choice: ResolutionChoice::KeepBaseline,
                content: baseline_content.clone(),
            },
            ResolutionOption {
                choice: ResolutionChoice::TakeIncoming,
                content: incoming_content.clone(),
            },
        ];
        if let (Some(ours), Some(theirs)) = (baseline_content, incoming_content) {
            for (choice, order) in [
                (ResolutionChoice::BaselineThenIncoming, UnionOrder::OursFirst),
                (ResolutionChoice::IncomingThenBaseline, UnionOrder::TheirsFirst),
            ] {
                if let Some(content) = merge3(base_text, ours, theirs, Some(order))? {
                    options.push(ResolutionOption {
                        choice,
                        content: Some(content),
                    });
                }
            }
        }

        Ok(Escalation {
            id: Uuid::new_v4().to_string(),
            record_id: record_id.to_string(),
            path: path.to_path_buf(),
            baseline_tasks: baseline_tasks.to_vec(),
            incoming_tasks: incoming_tasks.to_vec(),
            base: base.cloned(),
            baseline: baseline_content.clone(),
            incoming: incoming_content.clone(),
            baseline_diff: render_diff(path, base_text, baseline_content.as_deref())?,
            incoming_diff: render_diff(path, base_text, incoming_content.as_deref())?,
            options,
        })
    }
}

fn strip_eol(line: &str) -> &str {
    line.trim_end_matches('\n').trim_end_matches('\r')
}

fn slice_lines(lines: &[&str], from: usize, to: usize) -> Result<String> {
    lines
        .get(from..to)
        .map(|l| l.concat())
        .ok_or_else(|| Error::Validation(format!("line range {}..{} out of bounds", from, to)))
}

/// Zero-context hunks of `new` against `old`, in base line coordinates.
fn line_edits(old: &str, new: &str) -> Result<Vec<Edit>> {
    let mut opts = DiffOptions::new();
    opts.context_lines(0).interhunk_lines(0).force_text(true);
    let patch = Patch::from_buffers(old.as_bytes(), None, new.as_bytes(), None, Some(&mut opts))?;
    let new_lines: Vec<&str> = new.split_inclusive('\n').collect();

    let mut edits = Vec::with_capacity(patch.num_hunks());
    for idx in 0..patch.num_hunks() {
        let (hunk, _) = patch.hunk(idx)?;
        let removed = hunk.old_lines() as usize;
        let added = hunk.new_lines() as usize;
        // Pure inserts report the line they follow; edits the first line hit.
        let start = if removed == 0 {
            hunk.old_start() as usize
        } else {
            (hunk.old_start() as usize).saturating_sub(1)
        };
        let new_start = if added == 0 {
            hunk.new_start() as usize
        } else {
            (hunk.new_start() as usize).saturating_sub(1)
        };
        let lines = new_lines
            .get(new_start..new_start + added)
            .ok_or_else(|| Error::Validation("hunk outside new content".to_string()))?
            .iter()
            .map(|l| l.to_string())
            .collect();
        edits.push(Edit {
            start,
            end: start + removed,
            lines,
        });
    }
    Ok(edits)
}

/// Three-way line merge. Returns `None` on a clash unless `order` says how
/// to keep both sides.
fn merge3(base: &str, ours: &str, theirs: &str, order: Option<UnionOrder>) -> Result<Option<String>> {
    let base_lines: Vec<&str> = base.split_inclusive('\n').collect();
    let mut edits: Vec<(Side, Edit)> = line_edits(base, ours)?
        .into_iter()
        .map(|e| (Side::Ours, e))
        .chain(line_edits(base, theirs)?.into_iter().map(|e| (Side::Theirs, e)))
        .collect();
    edits.sort_by_key(|(side, e)| (e.start, e.end, *side == Side::Theirs));

    let mut out = String::new();
    let mut pos = 0;
    let mut i = 0;
    while i < edits.len() {
        let lo = edits[i].1.start;
        let mut hi = edits[i].1.end;
        let mut j = i + 1;
        // Inserts touching a cluster join it; adjacent replacements do not.
        while j < edits.len()
            && (edits[j].1.start < hi
                || (edits[j].1.start == hi && (edits[j].1.start == edits[j].1.end || lo == hi)))
        {
            hi = hi.max(edits[j].1.end);
            j += 1;
        }
        let cluster = &edits[i..j];
        out.push_str(&slice_lines(&base_lines, pos, lo)?);

        let ours_part = render_side(&base_lines, cluster, Side::Ours, lo, hi)?;
        let theirs_part = render_side(&base_lines, cluster, Side::Theirs, lo, hi)?;
        let has_ours = cluster.iter().any(|(s, _)| *s == Side::Ours);
        let has_theirs = cluster.iter().any(|(s, _)| *s == Side::Theirs);
        match (has_ours, has_theirs) {
            (true, false) => out.push_str(&ours_part),
            (false, _) => out.push_str(&theirs_part),
            (true, true) if ours_part == theirs_part => out.push_str(&ours_part),
            (true, true) => {
                let (first, second) = match order {
                    None => return Ok(None),
                    Some(UnionOrder::OursFirst) => (ours_part, theirs_part),
                    Some(UnionOrder::TheirsFirst) => (theirs_part, ours_part),
                };
                out.push_str(&first);
                if !first.is_empty() && !first.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&second);
            }
        }
        pos = hi;
        i = j;
    }
    out.push_str(&slice_lines(&base_lines, pos, base_lines.len())?);
    Ok(Some(out))
}

/// The base region `lo..hi` with one side's edits applied.
fn render_side(
    base_lines: &[&str],
    cluster: &[(Side, Edit)],
    side: Side,
    lo: usize,
    hi: usize,
) -> Result<String> {
    let mut out = String::new();
    let mut pos = lo;
    for (_, edit) in cluster.iter().filter(|(s, _)| *s == side) {
        out.push_str(&slice_lines(base_lines, pos, edit.start)?);
        out.push_str(&edit.lines.concat());
        pos = edit.end;
    }
    out.push_str(&slice_lines(base_lines, pos, hi)?);
    Ok(out)
}

fn render_diff(path: &Path, base: &str, version: Option<&str>) -> Result<String> {
    let mut opts = DiffOptions::new();
    opts.context_lines(DIFF_CONTEXT).force_text(true);
    let mut patch = Patch::from_buffers(
        base.as_bytes(),
        Some(path),
        version.unwrap_or("").as_bytes(),
        Some(path),
        Some(&mut opts),
    )?;
    let buf = patch.to_buf()?;
    let mut diff = String::from_utf8_lossy(&buf).into_owned();
    if version.is_none() {
        diff.push_str("(file deleted)\n");
    }
    Ok(diff)
}
