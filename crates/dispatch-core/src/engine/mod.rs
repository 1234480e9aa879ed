//! The single-writer sync engine.
//!
//! [`SyncEngine::run`] owns the order store, the reconciliation state, the
//! assignment overlays and the metrics aggregator. Commands from
//! [`EngineHandle`]s, channel events, backend results and timers are all
//! processed in one `tokio::select!` loop, so no two mutations ever
//! interleave. Network calls run in spawned tasks and re-enter the loop as
//! completions; the loop itself never waits on the network.

pub mod event_bus;
mod handle;

pub use handle::{EngineHandle, Selection};

use crate::assignment::{AssignmentCoordinator, ConfirmationOutcome};
use crate::metrics::MetricsAggregator;
use crate::reconciliation::{EventOutcome, ReconciliationEngine};
use crate::store::{OrderStateStore, StoreView, UpsertOutcome};
use crate::SyncError;
use dispatch_backend::{BackendError, BackendService, PullResponse};
use dispatch_channel::{SyncChannel, Subscription};
use dispatch_config::{ClientRole, Config};
use dispatch_storage::{CacheLoad, PersistenceFallback, StorageService};
use dispatch_types::{
	current_timestamp, truncate_id, AssignmentConfirmation, AssignmentIntent, AssignmentResult,
	ChannelEvent, ChannelStatus, Credentials, DashboardMetrics, EngineEvent, EventKind, NewOrder,
	Order, OrderStatus, ReconcileReport, RejectionReason, Snapshot, EVENT_SCHEMA_VERSION,
};
use event_bus::EventBus;
use handle::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::instrument;

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Capacity of the command queue shared by all handles.
const COMMAND_QUEUE: usize = 256;

/// Signals forwarded from channel subscriptions.
enum Inbound {
	Event(ChannelEvent),
	Status(ChannelStatus),
}

/// Results of spawned backend calls.
enum Completion {
	Pulled(Result<PullResponse, BackendError>),
	Assigned {
		intent: AssignmentIntent,
		result: Result<AssignmentConfirmation, BackendError>,
		reply: Reply<AssignmentResult>,
	},
	Transitioned {
		order_id: String,
		status: OrderStatus,
		result: Result<Order, BackendError>,
		reply: Reply<Order>,
	},
	Submitted {
		result: Result<Order, BackendError>,
		reply: Reply<Order>,
	},
}

/// Bookkeeping for the single in-flight pull.
#[derive(Default)]
struct PullState {
	in_flight: bool,
	/// A full pull was asked for while another pull was running.
	queued_full: bool,
	waiters: Vec<Reply<ReconcileReport>>,
	queued_waiters: Vec<Reply<ReconcileReport>>,
	/// Authority clock of the last successful pull, for delta pulls.
	server_time: Option<u64>,
	/// Store revision when the running pull was sent.
	issued_at: u64,
}

/// Owns all mutable sync state of one client.
pub struct SyncEngine {
	role: ClientRole,
	credentials: Credentials,
	pull_interval: Duration,
	backend: Arc<BackendService>,
	channel: SyncChannel,
	fallback: PersistenceFallback,
	bus: EventBus,
	commands: mpsc::Receiver<Command>,
	view_tx: watch::Sender<StoreView>,
	metrics_tx: watch::Sender<DashboardMetrics>,
	store: OrderStateStore,
	reconciler: ReconciliationEngine,
	coordinator: AssignmentCoordinator,
	aggregator: MetricsAggregator,
}

impl SyncEngine {
	/// Wires an engine and the handle consumers use to reach it.
	pub fn new(
		config: &Config,
		storage: Arc<StorageService>,
		backend: Arc<BackendService>,
		channel: SyncChannel,
		bus: EventBus,
	) -> (Self, EngineHandle) {
		let fallback_minutes = config.metrics.fallback_delivery_minutes;
		let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
		let (view_tx, view_rx) = watch::channel(StoreView::default());
		let (metrics_tx, metrics_rx) = watch::channel(DashboardMetrics::empty(fallback_minutes));

		let engine = Self {
			role: config.client.role,
			credentials: config.client.credentials(),
			pull_interval: config.sync.pull_interval(),
			fallback: PersistenceFallback::new(storage, config.client.id.clone()),
			backend,
			channel,
			bus: bus.clone(),
			commands,
			view_tx,
			metrics_tx,
			store: OrderStateStore::new(),
			reconciler: ReconciliationEngine::new(
				config.sync.dedup_window(),
				config.sync.confirmation_timeout(),
			),
			coordinator: AssignmentCoordinator::new(
				config.partner_id().map(String::from),
				config.sync.overlay_timeout(),
			),
			aggregator: MetricsAggregator::new(fallback_minutes),
		};
		let handle = EngineHandle::new(command_tx, view_rx, metrics_rx, bus);
		(engine, handle)
	}

	/// Runs until a handle requests shutdown or every handle is dropped.
	pub async fn run(self) -> Result<(), SyncError> {
		let SyncEngine {
			role,
			credentials,
			pull_interval,
			backend,
			channel,
			fallback,
			bus,
			mut commands,
			view_tx,
			metrics_tx,
			store,
			reconciler,
			coordinator,
			aggregator,
		} = self;

		let (completion_tx, mut completions) = mpsc::unbounded_channel();
		let (snapshot_tx, snapshot_rx) = watch::channel(None);
		let mut state = EngineState {
			role,
			backend,
			bus,
			completions: completion_tx,
			view_tx,
			metrics_tx,
			snapshot_tx: Some(snapshot_tx),
			store,
			reconciler,
			coordinator,
			aggregator,
			pull: PullState::default(),
			published_revision: None,
		};

		// Seed from the cache before anything else touches the store.
		match fallback.restore().await {
			CacheLoad::Restored(snapshot) => {
				tracing::info!(orders = snapshot.orders.len(), "Seeded store from cache");
				state.store.seed(snapshot.orders, current_timestamp());
			},
			CacheLoad::Reset { reason } => {
				tracing::warn!(reason = %reason, "Local cache discarded");
				state.notify(EngineEvent::CacheReset { reason });
			},
			CacheLoad::Empty => {},
		}
		state.publish_state();

		let persister = tokio::spawn(persist(fallback, snapshot_rx));

		let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
		let subscriptions = subscribe_all(&channel, inbound_tx);
		if let Err(e) = channel.connect(&credentials).await {
			tracing::warn!(error = %e, "Channel unavailable, relying on periodic pulls");
			state.notify(EngineEvent::Channel(ChannelStatus::Disconnected {
				reason: e.to_string(),
			}));
		}

		state.start_pull(true, None);

		let mut pull_tick = tokio::time::interval(pull_interval);
		pull_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
		pull_tick.tick().await;

		tracing::info!(role = ?state.role, "Sync engine started");

		loop {
			let deadline = state.coordinator.next_deadline();
			let overlay_expiry = async move {
				match deadline {
					Some(deadline) => tokio::time::sleep_until(deadline).await,
					None => std::future::pending::<()>().await,
				}
			};

			tokio::select! {
				command = commands.recv() => {
					match command {
						Some(Command::Shutdown) | None => break,
						Some(command) => state.on_command(command),
					}
				}

				Some(completion) = completions.recv() => {
					state.on_completion(completion);
				}

				Some(signal) = inbound.recv() => {
					match signal {
						Inbound::Event(event) => state.on_event(event),
						Inbound::Status(status) => state.on_channel_status(status),
					}
				}

				_ = pull_tick.tick() => {
					let full = state.store.has_unconfirmed() || state.pull.server_time.is_none();
					state.start_pull(full, None);
				}

				_ = overlay_expiry => {
					state.expire_overlays();
				}
			}
		}

		tracing::info!("Stopping sync engine");
		drop(subscriptions);
		if let Err(e) = channel.disconnect().await {
			tracing::warn!(error = %e, "Channel disconnect failed");
		}

		// Closing the snapshot watch lets the persister flush and exit.
		state.snapshot_tx.take();
		if let Err(e) = persister.await {
			tracing::warn!(error = %e, "Snapshot persister ended abnormally");
		}
		Ok(())
	}
}

/// Mutable state of a running engine.
struct EngineState {
	role: ClientRole,
	backend: Arc<BackendService>,
	bus: EventBus,
	completions: mpsc::UnboundedSender<Completion>,
	view_tx: watch::Sender<StoreView>,
	metrics_tx: watch::Sender<DashboardMetrics>,
	snapshot_tx: Option<watch::Sender<Option<Snapshot>>>,
	store: OrderStateStore,
	reconciler: ReconciliationEngine,
	coordinator: AssignmentCoordinator,
	aggregator: MetricsAggregator,
	pull: PullState,
	published_revision: Option<u64>,
}

impl EngineState {
	fn on_command(&mut self, command: Command) {
		match command {
			Command::Assign {
				order_id,
				partner_id,
				token,
				reply,
			} => self.on_assign(order_id, partner_id, token, reply),
			Command::Transition {
				order_id,
				status,
				reply,
			} => self.on_transition(order_id, status, reply),
			Command::Submit { order, reply } => self.on_submit(order, reply),
			Command::Refresh { reply } => self.start_pull(true, Some(reply)),
			Command::Overlays { reply } => {
				let _ = reply.send(Ok(self.coordinator.overlays(Instant::now())));
			},
			Command::Shutdown => {},
		}
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(&order_id), partner_id = %partner_id))]
	fn on_assign(
		&mut self,
		order_id: String,
		partner_id: String,
		token: Option<String>,
		reply: Reply<AssignmentResult>,
	) {
		let intent = match self.coordinator.prepare_intent(&order_id, &partner_id, token) {
			Ok(intent) => intent,
			Err(e) => {
				tracing::debug!(error = %e, "Assignment request refused");
				let _ = reply.send(Err(e));
				return;
			},
		};

		if self.coordinator.begin(&intent, Instant::now()) {
			self.notify(EngineEvent::AssignmentPending {
				order_id: intent.order_id.clone(),
				partner_id: intent.partner_id.clone(),
				token: intent.token.clone(),
			});
		}
		tracing::info!("Forwarding assignment intent");

		let backend = self.backend.clone();
		let completions = self.completions.clone();
		tokio::spawn(async move {
			let result = backend.assign(&intent).await;
			let _ = completions.send(Completion::Assigned {
				intent,
				result,
				reply,
			});
		});
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(&order_id), status = %status))]
	fn on_transition(&mut self, order_id: String, status: OrderStatus, reply: Reply<Order>) {
		if let Err(e) = self
			.coordinator
			.check_transition(&self.store, &order_id, status)
		{
			tracing::debug!(error = %e, "Transition refused locally");
			self.notify(EngineEvent::TransitionRejected {
				order_id,
				status,
				reason: e.to_string(),
			});
			let _ = reply.send(Err(e));
			return;
		}

		let backend = self.backend.clone();
		let completions = self.completions.clone();
		tokio::spawn(async move {
			let result = backend.transition(&order_id, status).await;
			let _ = completions.send(Completion::Transitioned {
				order_id,
				status,
				result,
				reply,
			});
		});
	}

	fn on_submit(&mut self, order: NewOrder, reply: Reply<Order>) {
		if self.role == ClientRole::Partner {
			let _ = reply.send(Err(SyncError::Validation(
				"partner clients cannot submit orders".into(),
			)));
			return;
		}
		if order.items.is_empty() {
			let _ = reply.send(Err(SyncError::Validation("order has no items".into())));
			return;
		}

		let backend = self.backend.clone();
		let completions = self.completions.clone();
		tokio::spawn(async move {
			let result = backend.create_order(&order).await;
			let _ = completions.send(Completion::Submitted { result, reply });
		});
	}

	fn on_completion(&mut self, completion: Completion) {
		match completion {
			Completion::Pulled(result) => self.on_pulled(result),
			Completion::Assigned {
				intent,
				result,
				reply,
			} => self.on_assigned(intent, result, reply),
			Completion::Transitioned {
				order_id,
				status,
				result,
				reply,
			} => self.on_transitioned(order_id, status, result, reply),
			Completion::Submitted { result, reply } => {
				let result = result.map(|order| {
					tracing::info!(order_id = %truncate_id(&order.id), code = %order.code, "Order created");
					self.store.upsert(order.clone());
					order
				});
				if let Err(e) = &result {
					self.on_backend_error(e);
				}
				self.publish_state();
				let _ = reply.send(result.map_err(SyncError::from));
			},
		}
	}

	fn on_pulled(&mut self, result: Result<PullResponse, BackendError>) {
		self.pull.in_flight = false;
		let waiters = std::mem::take(&mut self.pull.waiters);

		match result {
			Ok(pull) => {
				self.pull.server_time = Some(pull.server_time);
				let report = self
					.reconciler
					.reconcile(&mut self.store, pull, self.pull.issued_at, current_timestamp());
				self.notify(EngineEvent::Reconciled(report.clone()));
				self.publish_state();
				for waiter in waiters {
					let _ = waiter.send(Ok(report.clone()));
				}
			},
			Err(e) => {
				tracing::warn!(error = %e, "Pull failed");
				self.on_backend_error(&e);
				let e = SyncError::from(e);
				for waiter in waiters {
					let _ = waiter.send(Err(e.clone()));
				}
			},
		}

		if self.pull.queued_full || !self.pull.queued_waiters.is_empty() {
			let full = std::mem::take(&mut self.pull.queued_full);
			self.pull.waiters = std::mem::take(&mut self.pull.queued_waiters);
			self.start_pull(full, None);
		}
	}

	#[instrument(skip_all, fields(order_id = %truncate_id(&intent.order_id), partner_id = %intent.partner_id))]
	fn on_assigned(
		&mut self,
		intent: AssignmentIntent,
		result: Result<AssignmentConfirmation, BackendError>,
		reply: Reply<AssignmentResult>,
	) {
		match result {
			Ok(confirmation) => {
				self.apply_confirmation(&confirmation);
				self.publish_state();
				let _ = reply.send(Ok(AssignmentResult::Accepted {
					order_id: confirmation.order_id,
					partner_id: confirmation.partner_id,
				}));
			},
			Err(BackendError::AlreadyAssigned(order_id)) => {
				tracing::info!("Assignment lost to another partner");
				self.coordinator.reject(&intent.token);
				self.notify(EngineEvent::AssignmentRejected {
					order_id: order_id.clone(),
					token: intent.token,
					reason: "ALREADY_ASSIGNED".to_string(),
				});
				let _ = reply.send(Ok(AssignmentResult::Rejected {
					order_id,
					reason: RejectionReason::AlreadyAssigned,
				}));
			},
			Err(e) => {
				tracing::warn!(error = %e, "Assignment intent failed");
				self.coordinator.reject(&intent.token);
				self.on_backend_error(&e);
				self.notify(EngineEvent::AssignmentRejected {
					order_id: intent.order_id,
					token: intent.token,
					reason: e.to_string(),
				});
				let _ = reply.send(Err(e.into()));
			},
		}
	}

	fn on_transitioned(
		&mut self,
		order_id: String,
		status: OrderStatus,
		result: Result<Order, BackendError>,
		reply: Reply<Order>,
	) {
		match result {
			Ok(order) => {
				match self.store.upsert(order.clone()) {
					UpsertOutcome::Rejected(reason) => {
						tracing::debug!(
							order_id = %truncate_id(&order_id),
							reason = %reason,
							"Transition result older than local state"
						);
					},
					_ => {
						if order.status.is_terminal() {
							if let Some(partner_id) = &order.assigned_partner {
								self.store.release_partner(partner_id, Some(&order.id));
							}
						}
					},
				}
				tracing::info!(order_id = %truncate_id(&order_id), status = %status, "Transition applied");
				self.notify(EngineEvent::TransitionApplied { order_id, status });
				self.publish_state();
				let _ = reply.send(Ok(order));
			},
			Err(e) => {
				tracing::warn!(order_id = %truncate_id(&order_id), error = %e, "Transition failed");
				self.on_backend_error(&e);
				if matches!(e, BackendError::InvalidTransition(_)) {
					// The authority disagrees with what we allowed locally.
					self.request_resync(format!(
						"transition of {} refused by backend",
						truncate_id(&order_id)
					));
				}
				self.notify(EngineEvent::TransitionRejected {
					order_id,
					status,
					reason: e.to_string(),
				});
				let _ = reply.send(Err(e.into()));
			},
		}
	}

	fn on_event(&mut self, event: ChannelEvent) {
		let outcome = self
			.reconciler
			.apply_event(&mut self.store, &event, Instant::now());

		match outcome {
			EventOutcome::Assignment(confirmation) => self.apply_confirmation(&confirmation),
			EventOutcome::ResyncNeeded { order_id, reason } => {
				tracing::debug!(order_id = %truncate_id(&order_id), "Event needs resync");
				self.request_resync(reason);
			},
			EventOutcome::Applied(UpsertOutcome::Rejected(reason)) => {
				tracing::debug!(kind = event.kind().as_str(), reason = %reason, "Event rejected by store");
			},
			EventOutcome::Duplicate => {
				tracing::trace!(kind = event.kind().as_str(), "Duplicate event dropped");
			},
			EventOutcome::OutOfSequence { sequence, highest } => {
				tracing::debug!(
					kind = event.kind().as_str(),
					sequence,
					highest,
					"Out-of-sequence event dropped"
				);
			},
			EventOutcome::UnsupportedSchema { version } => {
				tracing::warn!(
					kind = event.kind().as_str(),
					version,
					supported = EVENT_SCHEMA_VERSION,
					"Event schema not supported, pulling instead"
				);
				self.request_resync(format!("unsupported event schema version {}", version));
			},
			EventOutcome::Applied(_) | EventOutcome::PartnerUpdated(_) => {},
		}
		self.publish_state();
	}

	fn on_channel_status(&mut self, status: ChannelStatus) {
		match &status {
			ChannelStatus::Connected => tracing::info!("Channel connected"),
			ChannelStatus::Disconnected { reason } => {
				tracing::warn!(reason = %reason, "Channel disconnected");
			},
			ChannelStatus::ResyncRequired => {},
			ChannelStatus::Unauthorized { reason } => {
				tracing::error!(reason = %reason, "Channel refused credentials");
				self.backend.invalidate_credentials();
				self.notify(EngineEvent::AuthFailed {
					reason: reason.clone(),
				});
			},
		}
		let resync = status == ChannelStatus::ResyncRequired;
		self.notify(EngineEvent::Channel(status));
		if resync {
			self.request_resync("channel reconnected".into());
		}
	}

	/// Routes a confirmation from either path through the coordinator.
	fn apply_confirmation(&mut self, confirmation: &AssignmentConfirmation) {
		match self
			.coordinator
			.apply_confirmation(&mut self.store, confirmation)
		{
			ConfirmationOutcome::Applied => {
				self.notify(EngineEvent::AssignmentAccepted {
					order_id: confirmation.order_id.clone(),
					partner_id: confirmation.partner_id.clone(),
					token: confirmation.token.clone(),
				});
			},
			ConfirmationOutcome::Duplicate => {},
			ConfirmationOutcome::Conflict { .. }
			| ConfirmationOutcome::Rejected(_)
			| ConfirmationOutcome::UnknownOrder => {
				self.request_resync(format!(
					"assignment of {} disagrees with local state",
					truncate_id(&confirmation.order_id)
				));
			},
		}
	}

	fn expire_overlays(&mut self) {
		for overlay in self.coordinator.expire(Instant::now()) {
			tracing::info!(
				order_id = %truncate_id(&overlay.order_id),
				partner_id = %overlay.partner_id,
				"Assignment overlay expired without confirmation"
			);
			self.notify(EngineEvent::OverlayExpired {
				order_id: overlay.order_id,
				token: overlay.token,
			});
		}
	}

	fn request_resync(&mut self, reason: String) {
		tracing::info!(reason = %reason, "Resync requested");
		self.notify(EngineEvent::ResyncRequested { reason });
		self.start_pull(true, None);
	}

	/// Spawns a pull unless one is running, in which case full pulls and
	/// waiters are queued behind it.
	fn start_pull(&mut self, full: bool, waiter: Option<Reply<ReconcileReport>>) {
		if self.pull.in_flight {
			if full || waiter.is_some() {
				self.pull.queued_full |= full;
				self.pull.queued_waiters.extend(waiter);
			}
			return;
		}

		let since = if full || self.store.has_unconfirmed() {
			None
		} else {
			self.pull.server_time
		};
		self.pull.in_flight = true;
		self.pull.issued_at = self.store.revision();
		self.pull.waiters.extend(waiter);

		let backend = self.backend.clone();
		let completions = self.completions.clone();
		tokio::spawn(async move {
			let result = backend.pull_orders(since).await;
			let _ = completions.send(Completion::Pulled(result));
		});
	}

	fn on_backend_error(&mut self, error: &BackendError) {
		if let BackendError::Auth(reason) = error {
			self.notify(EngineEvent::AuthFailed {
				reason: reason.clone(),
			});
		}
	}

	/// Publishes view, metrics and snapshot when the store moved.
	fn publish_state(&mut self) {
		let revision = self.store.revision();
		if self.published_revision == Some(revision) {
			return;
		}
		self.published_revision = Some(revision);

		self.view_tx.send_replace(self.store.view());
		let metrics = self.aggregator.recompute(&self.store);
		self.metrics_tx.send_if_modified(|current| {
			if *current == metrics {
				return false;
			}
			*current = metrics;
			true
		});
		if let Some(snapshot_tx) = &self.snapshot_tx {
			snapshot_tx.send_replace(Some(self.store.snapshot(current_timestamp())));
		}
		self.notify(EngineEvent::StoreChanged { revision });
	}

	fn notify(&self, event: EngineEvent) {
		// No subscribers is fine.
		let _ = self.bus.publish(event);
	}
}

fn subscribe_all(channel: &SyncChannel, inbound: mpsc::UnboundedSender<Inbound>) -> Vec<Subscription> {
	let mut subscriptions: Vec<Subscription> = EventKind::all()
		.map(|kind| {
			let inbound = inbound.clone();
			channel.subscribe(kind, move |event| {
				let _ = inbound.send(Inbound::Event(event.clone()));
			})
		})
		.collect();
	subscriptions.push(channel.subscribe_status(move |status| {
		let _ = inbound.send(Inbound::Status(status.clone()));
	}));
	subscriptions
}

/// Saves snapshots one at a time, always the latest.
async fn persist(fallback: PersistenceFallback, mut snapshots: watch::Receiver<Option<Snapshot>>) {
	while snapshots.changed().await.is_ok() {
		let snapshot = snapshots.borrow_and_update().clone();
		if let Some(snapshot) = snapshot {
			if let Err(e) = fallback.save(&snapshot).await {
				tracing::warn!(error = %e, "Failed to persist snapshot");
			}
		}
	}
}
