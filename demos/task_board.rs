// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task board demo.
//!
//! Demonstrates:
//! 1. Two views mounting the same query (one remote call)
//! 2. Rendering loading / empty / populated / error branches
//! 3. A mutation that invalidates the list, and the views refreshing
//! 4. A failed write surfacing its error without touching the cache
//! 5. Cache stats and metrics captured by a debugging recorder
//!
//! Runs entirely in memory.
//!
//! # Run
//!
//! ```bash
//! cargo run --example task_board
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use query_sync::remote::Fault;
use query_sync::{
    decode, query_key, render, Filter, InMemoryRemote, Mutation, QueryCache, QueryCacheConfig, QueryError, QueryFn,
    QueryKey, QueryObserver, QueryOptions, QueryState, RemoteError, RemoteStore, RenderArms,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct Task {
    title: String,
    done: bool,
}

fn tasks_key(user: &str) -> QueryKey {
    query_key!["tasks", user]
}

fn list_tasks(remote: &Arc<InMemoryRemote>, user: &str) -> QueryFn<Vec<Task>> {
    let remote = remote.clone();
    let user = user.to_string();
    QueryFn::from_remote(move || {
        let remote = remote.clone();
        let filter = Filter::all().eq("user_id", user.clone()).order("title", true);
        async move { remote.select("tasks", &filter).await }
    })
    .map(|rows: Vec<Value>| decode(Value::Array(rows)))
}

fn board(state: &QueryState<Vec<Task>>) -> String {
    render(
        state,
        RenderArms {
            error: |e: Option<&QueryError>| format!("⚠️  {}", e.map(ToString::to_string).unwrap_or_default()),
            loading: || "⏳ loading...".to_string(),
            empty: || "📭 nothing planned yet".to_string(),
            populated: |tasks: &Arc<Vec<Task>>| {
                tasks
                    .iter()
                    .map(|t| format!("[{}] {}", if t.done { "x" } else { " " }, t.title))
                    .collect::<Vec<_>>()
                    .join("\n      ")
            },
        },
    )
}

async fn settled(observer: &QueryObserver<Vec<Task>>) -> QueryState<Vec<Task>> {
    let mut updates = observer.watch();
    let state = match updates.wait_for(|s| !s.is_fetching).await {
        Ok(state) => state.clone(),
        Err(_) => observer.state(),
    };
    state
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                 query-sync: Task Board Demo                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    let remote = Arc::new(InMemoryRemote::new());
    remote.set_latency(Some(Duration::from_millis(50)));
    let cache = QueryCache::create(QueryCacheConfig::default());
    let key = tasks_key("u1");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Two views on the same list
    // ─────────────────────────────────────────────────────────────────────────
    println!("📋 Mounting the task list and the sidebar counter...");
    let list = QueryObserver::new(&cache, key.clone(), list_tasks(&remote, "u1"), QueryOptions::default());
    let sidebar = QueryObserver::new(&cache, key.clone(), list_tasks(&remote, "u1"), QueryOptions::default());
    list.mount()?;
    sidebar.mount()?;
    println!("   list:    {}", board(&list.state()));

    let state = settled(&list).await;
    println!("   list:    {}", board(&state));
    println!("   remote selects so far: {}", remote.calls("tasks", "select"));

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Add tasks; the views refresh through invalidation
    // ─────────────────────────────────────────────────────────────────────────
    let remote_write = remote.clone();
    let add_task = Mutation::from_remote(&cache, move |title: String| {
        let remote = remote_write.clone();
        async move {
            remote
                .insert("tasks", json!({"user_id": "u1", "title": title, "done": false}))
                .await
        }
    })
    .invalidates([key.clone()]);

    for title in ["Breathing exercise", "Evening reflection"] {
        println!("\n✏️  Adding \"{title}\"...");
        add_task.mutate(title.to_string()).await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = settled(&list).await;
        println!("   list:    {}", board(&state));
        println!("   sidebar: {} task(s)", sidebar.state().data.map_or(0, |t| t.len()));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. A rejected write
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚫 Adding a task the store rejects...");
    remote.fail_next(Fault::Remote(RemoteError::new("42501", "row-level security policy violation")));
    match add_task.mutate("Someone else's task".to_string()).await {
        Ok(_) => println!("   unexpected success"),
        Err(e) => println!("   mutation failed: {e}"),
    }
    println!("   list still shows {} task(s)", list.state().data.map_or(0, |t| t.len()));

    // ─────────────────────────────────────────────────────────────────────────
    // 4. A failed refetch keeps the last good data
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔌 Refetching while the network is down...");
    remote.fail_next(Fault::Transport("connection reset by peer".into()));
    let _ = list.refetch().await;
    let state = list.state();
    println!("   is_error={} data kept={}", state.is_error, state.data.is_some());
    println!("   list:    {}", board(&state));

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let stats = cache.stats();
    println!("\n📊 Cache Stats:");
    println!("   ┌─ entries={} subscribers={}", stats.entries, stats.subscribers);
    println!("   ├─ fetches={} deduplicated={} errors={}", stats.fetches, stats.deduplicated, stats.errors);
    println!("   └─ invalidations={} evictions={}", stats.invalidations, stats.evictions);

    cache.update_gauge_metrics();
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    list.unmount();
    sidebar.unmount();
    cache.dispose();
    println!("\n✅ Done.\n");
    Ok(())
}

/// Print every captured metric, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<(u8, String)> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let name = if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), labels.join(","))
        };

        match value {
            DebugValue::Counter(v) => lines.push((0, format!("counter   {name} = {v}"))),
            DebugValue::Gauge(v) => lines.push((1, format!("gauge     {name} = {:.0}", v.into_inner()))),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                lines.push((2, format!("histogram {name} count={count} avg={avg:.4}s")));
            }
        }
    }

    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for (_, line) in &lines {
        println!("   │  {line}");
    }
}
