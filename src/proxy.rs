//! The running proxy: one instance per process, constructed once from
//! injected parts and handed every inbound event.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{PartitionCache, PartitionStore};
use crate::classify::Classifier;
use crate::commands::ControlCommand;
use crate::config::Config;
use crate::event::{Event, HostBridge, HostReply};
use crate::lifecycle::{self, Lifecycle, Phase};
use crate::net::{Fetcher, HttpRequest, HttpResponse};
use crate::notify::NotificationBridge;
use crate::queue::{MutationQueue, QueueStore};
use crate::strategy::StrategyRouter;

/// Everything one intercepted request needs, cheap to clone into its task.
///
/// Requests are independent asynchronous units of work: there is no ordering
/// across keys, and two concurrent misses for the same key may both fetch
/// and both write (last write wins).
pub struct FetchHandler<S: PartitionStore, Q: QueueStore> {
  router: StrategyRouter<S>,
  queue: Arc<MutationQueue<Q>>,
  fetcher: Arc<dyn Fetcher>,
  intercepting: Arc<AtomicBool>,
}

impl<S: PartitionStore, Q: QueueStore> FetchHandler<S, Q> {
  /// Answer one intercepted request.
  pub async fn handle(&self, request: &HttpRequest) -> HttpResponse {
    // Until activation claims open sessions, traffic flows untouched.
    if !self.intercepting.load(Ordering::SeqCst) {
      return self.router.passthrough(request).await;
    }
    if !request.is_safe() {
      return self.mutate(request).await;
    }
    self.router.handle(request).await
  }

  /// Forward a mutating request; if the origin is unreachable, park it in
  /// the durable queue and acknowledge with a synthetic 503.
  async fn mutate(&self, request: &HttpRequest) -> HttpResponse {
    match self.fetcher.fetch(request).await {
      Ok(response) => response,
      Err(error) => {
        debug!(%error, url = %request.url, "mutation failed, queueing for replay");
        match self.queue.enqueue(request) {
          Ok(_) => HttpResponse::mutation_queued(),
          Err(enqueue_error) => {
            warn!(%enqueue_error, "failed to queue mutation");
            HttpResponse::service_unavailable()
          }
        }
      }
    }
  }
}

impl<S: PartitionStore, Q: QueueStore> Clone for FetchHandler<S, Q> {
  fn clone(&self) -> Self {
    Self {
      router: self.router.clone(),
      queue: Arc::clone(&self.queue),
      fetcher: Arc::clone(&self.fetcher),
      intercepting: Arc::clone(&self.intercepting),
    }
  }
}

/// The one running proxy instance.
pub struct Proxy<S: PartitionStore + 'static, Q: QueueStore + 'static> {
  cache: PartitionCache<S>,
  lifecycle: Lifecycle<S>,
  handler: FetchHandler<S, Q>,
  queue: Arc<MutationQueue<Q>>,
  fetcher: Arc<dyn Fetcher>,
  notifications: NotificationBridge,
  precache: Vec<String>,
  activate_on_start: bool,
  should_quit: bool,
}

impl<S: PartitionStore + 'static, Q: QueueStore + 'static> Proxy<S, Q> {
  pub fn new(config: &Config, store: S, queue_store: Q, fetcher: Arc<dyn Fetcher>) -> Self {
    let cache = PartitionCache::new(store, config.generation(), config.cache.max_ages());
    let classifier = Classifier::new(
      config.routing.exclusions.clone(),
      config.routing.asset_prefix.clone(),
      config.routing.api_prefix.clone(),
    );
    let router = StrategyRouter::new(
      cache.clone(),
      classifier,
      Arc::clone(&fetcher),
      config.routing.root_document.clone(),
    );
    let lifecycle = Lifecycle::new(cache.clone());
    let queue = Arc::new(MutationQueue::new(queue_store));
    let handler = FetchHandler {
      router,
      queue: Arc::clone(&queue),
      fetcher: Arc::clone(&fetcher),
      intercepting: lifecycle.interception_flag(),
    };
    let notifications = NotificationBridge::new(
      config.notifications.view_routes.clone(),
      config.notifications.default_icon.clone(),
      config.routing.root_document.clone(),
    );

    Self {
      cache,
      lifecycle,
      handler,
      queue,
      fetcher,
      notifications,
      precache: config.precache.clone(),
      activate_on_start: true,
      should_quit: false,
    }
  }

  /// Stay in `Installed` until the host sends `activate-new-version`.
  pub fn with_deferred_activation(mut self) -> Self {
    self.activate_on_start = false;
    self
  }

  #[allow(dead_code)]
  pub fn phase(&self) -> Phase {
    self.lifecycle.phase()
  }

  /// Handler for intercepted requests, independent of the event loop.
  #[allow(dead_code)]
  pub fn handler(&self) -> FetchHandler<S, Q> {
    self.handler.clone()
  }

  /// Install this generation and, unless activation is deferred, activate
  /// it. An install failure is not fatal: the proxy stays in `Installing`
  /// and passes all traffic through until a new generation replaces it.
  pub async fn start(&mut self) -> Result<()> {
    match self
      .lifecycle
      .install(self.fetcher.as_ref(), &self.precache)
      .await
    {
      Ok(report) if !report.complete() => {
        warn!(failed = report.failed.len(), "continuing with incomplete pre-warm");
      }
      Ok(_) => {}
      Err(install_error) => {
        error!(%install_error, "install failed; passing traffic through");
        return Ok(());
      }
    }

    if self.activate_on_start {
      self.lifecycle.activate()?;
    } else {
      info!("installed; waiting for activate-new-version");
    }
    Ok(())
  }

  /// Serve events until the host closes the bridge or sends shutdown.
  pub async fn run(&mut self, bridge: &mut HostBridge) -> Result<()> {
    self.start().await?;

    let replies = bridge.replies();
    while !self.should_quit {
      match bridge.next().await {
        Some(event) => self.handle_event(event, &replies)?,
        None => break,
      }
    }

    info!("host bridge closed, shutting down");
    Ok(())
  }

  fn handle_event(&mut self, event: Event, replies: &mpsc::UnboundedSender<HostReply>) -> Result<()> {
    match event {
      Event::Fetch { request, reply } => {
        let handler = self.handler.clone();
        tokio::spawn(async move {
          let _ = reply.send(handler.handle(&request).await);
        });
      }
      Event::Control(command) => self.handle_command(command),
      Event::Push(payload) => {
        let notification = self.notifications.notification(&payload);
        let _ = replies.send(HostReply::Notification { notification });
      }
      Event::ConnectivityRestored => {
        let queue = Arc::clone(&self.queue);
        let fetcher = Arc::clone(&self.fetcher);
        let replies = replies.clone();
        tokio::spawn(async move {
          match queue.drain_and_replay(fetcher.as_ref()).await {
            Ok(report) => {
              let _ = replies.send(HostReply::Replayed {
                replayed: report.replayed,
                remaining: report.remaining,
              });
            }
            Err(drain_error) => warn!(%drain_error, "queue drain failed"),
          }
        });
      }
      Event::Shutdown => self.should_quit = true,
    }
    Ok(())
  }

  fn handle_command(&mut self, command: ControlCommand) {
    match command {
      ControlCommand::ActivateNewVersion => {
        if self.lifecycle.phase() == Phase::Installing {
          warn!("ignoring activation request: install did not complete");
        } else if let Err(activate_error) = self.lifecycle.activate() {
          warn!(%activate_error, "activation failed");
        }
      }
      ControlCommand::PreCache { urls } => {
        let cache = self.cache.clone();
        let fetcher = Arc::clone(&self.fetcher);
        tokio::spawn(async move {
          match lifecycle::prewarm(&cache, fetcher.as_ref(), &urls).await {
            Ok(report) if report.complete() => {
              info!(prewarmed = report.prewarmed, "pre-cache complete");
            }
            Ok(report) => warn!(failed = report.failed.len(), "pre-cache incomplete"),
            Err(prewarm_error) => warn!(%prewarm_error, "pre-cache failed"),
          }
        });
      }
      ControlCommand::PurgeAll => {
        if let Err(purge_error) = self.cache.purge_all() {
          warn!(%purge_error, "purge failed");
        } else {
          info!("purged all partitions");
        }
      }
    }
  }
}
