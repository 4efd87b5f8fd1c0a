use crate::datastore::Datastore;
use crate::error::Result;
use crate::scope::FlowScope;
use crate::types::{ArtifactMap, Pathspec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Sidecar metadata written beside every card HTML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CardMeta {
    #[serde(rename = "type")]
    pub card_type: String,
    pub id: Option<String>,
    /// 8-hex-digit content hash of the HTML.
    pub hash: String,
}

/// Task-shaped view handed to card renderers: the pathspec plus the
/// step's user artifacts, without any datastore round-trip.
pub struct CardTaskView {
    pub pathspec: String,
    artifacts: ArtifactMap,
}

impl CardTaskView {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.artifacts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    pub fn artifacts(&self) -> &ArtifactMap {
        &self.artifacts
    }
}

/// A report generator. The only contract with the core: run after each
/// successful step, return an HTML blob.
pub trait CardRenderer: Send + Sync {
    fn render(&self, task: &CardTaskView) -> anyhow::Result<String>;
}

/// One declared card on a step.
#[derive(Clone)]
pub struct CardSpec {
    pub card_type: String,
    pub id: Option<String>,
    pub timeout: Option<Duration>,
    pub save_errors: bool,
    pub renderer: Arc<dyn CardRenderer>,
}

impl CardSpec {
    pub fn new(card_type: &str, renderer: Arc<dyn CardRenderer>) -> Self {
        Self {
            card_type: card_type.to_string(),
            id: None,
            timeout: None,
            save_errors: true,
            renderer,
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn save_errors(mut self, save_errors: bool) -> Self {
        self.save_errors = save_errors;
        self
    }
}

/// 8-hex-digit content hash of a card's HTML.
pub fn content_hash(html: &str) -> String {
    let digest = Sha256::digest(html.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Render a renderer on a scratch thread so hangs and panics stay
/// isolated from the task. `None` means timeout, panic, or error.
fn render_isolated(spec: &CardSpec, view: CardTaskView) -> Option<String> {
    let renderer = spec.renderer.clone();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let html = renderer.render(&view);
        let _ = tx.send(html);
    });
    let received = match spec.timeout {
        Some(budget) => rx.recv_timeout(budget).ok(),
        None => rx.recv().ok(),
    };
    match received {
        Some(Ok(html)) => Some(html),
        Some(Err(e)) => {
            tracing::warn!(card_type = %spec.card_type, error = %e, "card render failed");
            None
        }
        None => {
            tracing::warn!(card_type = %spec.card_type, "card render timed out or panicked");
            None
        }
    }
}

/// Render every declared card after a successful step and persist the
/// HTML plus its sidecar. Render failures are isolated: with
/// `save_errors` an empty card is still written, otherwise nothing is.
pub async fn render_cards(
    specs: &[CardSpec],
    scope: &FlowScope,
    pathspec: &Pathspec,
    datastore: &Arc<dyn Datastore>,
) -> Result<()> {
    let mut index = 0usize;
    for spec in specs {
        let view = CardTaskView {
            pathspec: pathspec.to_string(),
            artifacts: scope.user_artifacts(),
        };
        let html = render_isolated(spec, view);
        let html = match html {
            Some(html) => html,
            None if spec.save_errors => String::new(),
            None => continue,
        };
        let meta = CardMeta {
            card_type: spec.card_type.clone(),
            id: spec.id.clone(),
            hash: content_hash(&html),
        };
        datastore.save_card(pathspec, index, &html, &meta).await?;
        index += 1;
    }
    Ok(())
}
