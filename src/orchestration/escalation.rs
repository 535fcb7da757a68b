//! Escalation channel for conflicts that must not be auto-resolved.
//!
//! The scheduler sends an `EscalationRequest` carrying a oneshot reply
//! sender; a responder (human prompt, fixed policy, test script) answers
//! with a `Reply`. Only the subgraph depending on the conflicting tasks
//! waits for the answer.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

use crate::core::TaskId;
use crate::{rlog, rlog_debug, Error, Result};

/// Named ways to settle a semantic conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    KeepBaseline,
    TakeIncoming,
    BaselineThenIncoming,
    IncomingThenBaseline,
}

impl ResolutionChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionChoice::KeepBaseline => "keep_baseline",
            ResolutionChoice::TakeIncoming => "take_incoming",
            ResolutionChoice::BaselineThenIncoming => "baseline_then_incoming",
            ResolutionChoice::IncomingThenBaseline => "incoming_then_baseline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "keep_baseline" => Some(ResolutionChoice::KeepBaseline),
            "take_incoming" => Some(ResolutionChoice::TakeIncoming),
            "baseline_then_incoming" => Some(ResolutionChoice::BaselineThenIncoming),
            "incoming_then_baseline" => Some(ResolutionChoice::IncomingThenBaseline),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolutionChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One option offered to the decision-maker, with the file content it
/// would produce (`None` deletes the file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOption {
    pub choice: ResolutionChoice,
    pub content: Option<String>,
}

/// A semantic conflict waiting for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub record_id: String,
    pub path: PathBuf,
    /// Tasks whose merged work forms the baseline.
    pub baseline_tasks: Vec<TaskId>,
    pub incoming_tasks: Vec<TaskId>,
    pub base: Option<String>,
    pub baseline: Option<String>,
    pub incoming: Option<String>,
    /// Unified diffs of each candidate against the common base.
    pub baseline_diff: String,
    pub incoming_diff: String,
    pub options: Vec<ResolutionOption>,
}

impl Escalation {
    /// Every task whose dependents wait on this decision.
    pub fn tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self
            .baseline_tasks
            .iter()
            .chain(self.incoming_tasks.iter())
            .cloned()
            .collect();
        tasks.sort();
        tasks.dedup();
        tasks
    }

    pub fn option(&self, choice: ResolutionChoice) -> Option<&ResolutionOption> {
        self.options.iter().find(|o| o.choice == choice)
    }

    /// Prompt text shown to a human.
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.options.iter().map(|o| o.choice.as_str()).collect();
        format!(
            "Semantic conflict in {}\n--- baseline ({})\n{}\n--- incoming ({})\n{}\nOptions: {}, defer",
            self.path.display(),
            join_ids(&self.baseline_tasks),
            self.baseline_diff,
            join_ids(&self.incoming_tasks),
            self.incoming_diff,
            names.join(", ")
        )
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Choose(ResolutionChoice),
    /// Leave the conflict open; it is persisted and re-issued on resume.
    Defer,
}

#[derive(Debug)]
pub struct EscalationRequest {
    pub escalation: Escalation,
    pub reply: oneshot::Sender<Reply>,
}

/// Sending half held by the scheduler.
#[derive(Clone)]
pub struct EscalationChannel {
    tx: mpsc::Sender<EscalationRequest>,
}

impl EscalationChannel {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<EscalationRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Send an escalation and wait for the answer.
    pub async fn request(&self, escalation: Escalation) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        rlog!(
            "Escalating conflict {} on {}",
            escalation.id,
            escalation.path.display()
        );
        self.tx
            .send(EscalationRequest {
                escalation,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::EscalationClosed)?;
        reply_rx.await.map_err(|_| Error::EscalationClosed)
    }
}

/// Something that answers escalations.
pub trait Responder: Send {
    fn respond<'a>(&'a mut self, escalation: &'a Escalation) -> BoxFuture<'a, Reply>;
}

/// Answer requests until every sender is dropped.
pub async fn serve<R: Responder>(mut rx: mpsc::Receiver<EscalationRequest>, mut responder: R) {
    while let Some(request) = rx.recv().await {
        let reply = responder.respond(&request.escalation).await;
        rlog_debug!("Escalation {} answered: {:?}", request.escalation.id, reply);
        let _ = request.reply.send(reply);
    }
}

/// Always answers with the same reply.
pub struct FixedResponder(pub Reply);

impl Responder for FixedResponder {
    fn respond<'a>(&'a mut self, _: &'a Escalation) -> BoxFuture<'a, Reply> {
        let reply = self.0;
        Box::pin(async move { reply })
    }
}

/// Answers with a closure; handy for scripted decisions.
pub struct FnResponder<F>(pub F);

impl<F> Responder for FnResponder<F>
where
    F: FnMut(&Escalation) -> Reply + Send,
{
    fn respond<'a>(&'a mut self, escalation: &'a Escalation) -> BoxFuture<'a, Reply> {
        let reply = (self.0)(escalation);
        Box::pin(async move { reply })
    }
}

/// Asks on the terminal. Unreadable or unknown input defers.
pub struct PromptResponder;

impl Responder for PromptResponder {
    fn respond<'a>(&'a mut self, escalation: &'a Escalation) -> BoxFuture<'a, Reply> {
        let prompt = escalation.describe();
        Box::pin(async move {
            let answer = tokio::task::spawn_blocking(move || -> Option<String> {
                let mut stderr = std::io::stderr();
                let _ = writeln!(stderr, "{}", prompt);
                let _ = write!(stderr, "> ");
                let _ = stderr.flush();
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line).ok()?;
                Some(line)
            })
            .await
            .ok()
            .flatten();
            match answer.as_deref().and_then(ResolutionChoice::parse) {
                Some(choice) => Reply::Choose(choice),
                None => Reply::Defer,
            }
        })
    }
}
