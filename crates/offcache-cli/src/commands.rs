//! One-shot subcommands.

use anyhow::{Context, Result};
use chrono::Utc;

use offcache_core::http::Request;
use offcache_core::utils::{format_age, format_bytes};
use offcache_core::{Config, Lifecycle, Worker};

pub async fn install(config: &Config) -> Result<()> {
    let worker = Worker::start(config).await?;
    if worker.lifecycle().await == Lifecycle::Activated {
        println!("Version {} is already active", config.version);
        return Ok(());
    }

    let entries = worker
        .install()
        .await
        .with_context(|| format!("Installing version {}", config.version))?;
    let removed = worker.activate().await?;
    println!(
        "Installed {} assets for {}; removed {} old caches",
        entries, config.version, removed
    );
    Ok(())
}

pub async fn fetch(config: &Config, raw_url: &str) -> Result<()> {
    let worker = Worker::start(config).await?;
    let origin = config.origin_url()?;
    let url = origin
        .join(raw_url)
        .with_context(|| format!("Invalid URL '{}'", raw_url))?;

    let request = Request::infer(url);
    let routed = worker.handle_fetch(None, &request).await?;

    println!("{}", Worker::describe(&routed));
    if let Some(content_type) = routed.response.content_type() {
        println!("content-type: {}", content_type);
    }
    println!("{} body", format_bytes(routed.response.body.len() as u64));
    Ok(())
}

pub async fn sync(config: &Config) -> Result<()> {
    let worker = Worker::start(config).await?;
    let payload = worker.reconciler().snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

pub async fn status(config: &Config) -> Result<()> {
    let worker = Worker::start(config).await?;
    let store = worker.store();

    println!("origin:    {}", config.origin);
    println!("version:   {} ({})", config.version, worker.lifecycle().await);
    println!(
        "store:     {}{}",
        store.backend_name(),
        if store.is_degraded() { " (degraded)" } else { "" }
    );
    match store.last_sync().await {
        Some(at) => println!(
            "last sync: {}",
            format_age(Utc::now().signed_duration_since(at).num_minutes())
        ),
        None => println!("last sync: never"),
    }

    let mut keys = store.keys().await?;
    keys.sort();
    println!("records:   {}", if keys.is_empty() { "-".to_string() } else { keys.join(", ") });

    let mut caches = worker.caches().summaries().await;
    caches.sort_by(|a, b| a.name.cmp(&b.name));
    println!();
    if caches.is_empty() {
        println!("no caches");
    }
    for cache in caches {
        println!(
            "{} {:<28} {:>5} entries {:>10}  newest {}",
            if cache.current { "*" } else { " " },
            cache.name,
            cache.entries,
            format_bytes(cache.size_bytes),
            cache.newest_age.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
