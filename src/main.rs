//! marksync console demo.
//!
//! Opens two sessions ("tabs") for one user over an in-memory embedded store
//! and shows a bookmark added in one tab showing up once in the other, then
//! disappearing from both when deleted.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use marksync::app::App;
use marksync::managers::session_manager::BookmarkSession;
use marksync::services::settings_engine::{SettingsEngine, SettingsEngineTrait};
use marksync::types::errors::SessionError;
use marksync::types::session::UserId;
use marksync::view::{FormFeedback, ListView};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

fn section(name: &str) {
    println!("───────────────────────────────────────────────────────────────");
    println!("  {}", name);
    println!("───────────────────────────────────────────────────────────────");
}

fn render(label: &str, session: &BookmarkSession) {
    let view = ListView::of(session);
    if let Some(empty) = view.empty_message {
        println!("  [{}] {}", label, empty);
        return;
    }
    println!("  [{}] {} bookmark(s)", label, view.bookmarks.len());
    for b in &view.bookmarks {
        println!("      {}  {}  ({})", b.title, b.url, b.id);
    }
}

/// Waits until `done` holds for the session's list, or the timeout passes.
async fn settle(session: &BookmarkSession, done: impl Fn(&BookmarkSession) -> bool) -> bool {
    let mut changes = session.changes();
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !done(session) {
            if changes.changed().await.is_err() {
                return false;
            }
        }
        true
    })
    .await
    .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_env("MARKSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("marksync=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    println!();
    println!("  marksync v{} demo", env!("CARGO_PKG_VERSION"));
    println!();

    let settings = SettingsEngine::new(None);
    println!("  Backend mode: {:?}", settings.get_settings().backend.mode);
    let mut app = App::in_memory(settings)?;
    app.sign_in_local(UserId::new("demo-user"))?;

    section("Open two tabs");
    let (tab_a, err_a) = app.open_session().await?;
    let (tab_b, err_b) = app.open_session().await?;
    for err in [err_a, err_b].into_iter().flatten() {
        println!("  load error: {}", err);
    }
    render("A", &tab_a);
    render("B", &tab_b);

    section("Rejected submission");
    match tab_a.add_bookmark("not-a-url", "   ").await {
        Err(err @ SessionError::Validation(_)) => {
            for (field, message) in FormFeedback::from(&err).fields {
                println!("  {:?}: {}", field, message);
            }
        }
        other => println!("  unexpected outcome: {:?}", other),
    }

    section("Add in tab A");
    let docs = tab_a.add_bookmark("https://example.com/docs", "Docs").await?;
    println!("  stored {} at {}", docs.id, docs.created_at.to_rfc3339());
    let arrived = settle(&tab_b, |s| s.snapshot().iter().any(|b| b.id == docs.id)).await;
    println!("  tab B received it: {}", arrived);
    render("A", &tab_a);
    render("B", &tab_b);

    section("Delete in tab A, then again in tab B");
    tab_a.delete_bookmark(&docs.id).await?;
    let removed = settle(&tab_b, |s| s.snapshot().is_empty()).await;
    println!("  tab B saw the delete: {}", removed);
    match tab_b.delete_bookmark(&docs.id).await {
        Ok(()) => println!("  second delete from tab B: no error"),
        Err(e) => println!("  second delete from tab B failed: {}", e),
    }
    render("A", &tab_a);
    render("B", &tab_b);

    tab_a.close().await;
    tab_b.close().await;
    app.sign_out().await?;
    println!();
    println!("  Signed out; both tabs closed.");
    Ok(())
}
