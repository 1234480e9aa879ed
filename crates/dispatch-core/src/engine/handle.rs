//! Consumer side of the engine.
//!
//! Reads are served from watch channels without touching the engine task.
//! Writes are sent as commands and answered over a oneshot once the engine
//! has applied the authoritative result.

use super::event_bus::EventBus;
use crate::assignment::OverlayView;
use crate::store::StoreView;
use crate::SyncError;
use dispatch_types::{
	AssignmentResult, DashboardMetrics, EngineEvent, NewOrder, Order, OrderId, OrderStatus,
	PartnerId, ReconcileReport,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Requests handled by the engine task.
pub(crate) enum Command {
	Assign {
		order_id: OrderId,
		partner_id: PartnerId,
		token: Option<String>,
		reply: Reply<AssignmentResult>,
	},
	Transition {
		order_id: OrderId,
		status: OrderStatus,
		reply: Reply<Order>,
	},
	Submit {
		order: NewOrder,
		reply: Reply<Order>,
	},
	Refresh {
		reply: Reply<ReconcileReport>,
	},
	Overlays {
		reply: Reply<Vec<OverlayView>>,
	},
	Shutdown,
}

/// Cloneable handle to a running [`SyncEngine`](super::SyncEngine).
#[derive(Clone)]
pub struct EngineHandle {
	commands: mpsc::Sender<Command>,
	view: watch::Receiver<StoreView>,
	metrics: watch::Receiver<DashboardMetrics>,
	bus: EventBus,
}

impl EngineHandle {
	pub(crate) fn new(
		commands: mpsc::Sender<Command>,
		view: watch::Receiver<StoreView>,
		metrics: watch::Receiver<DashboardMetrics>,
		bus: EventBus,
	) -> Self {
		Self {
			commands,
			view,
			metrics,
			bus,
		}
	}

	/// The latest published store view.
	pub fn view(&self) -> StoreView {
		self.view.borrow().clone()
	}

	/// Derives a value from the store and follows its changes.
	pub fn subscribe<T, F>(&self, selector: F) -> Selection<StoreView, T>
	where
		T: Clone + PartialEq,
		F: Fn(&StoreView) -> T + Send + Sync + 'static,
	{
		Selection::new(self.view.clone(), selector)
	}

	/// Follows the dashboard metrics.
	pub fn subscribe_metrics(&self) -> Selection<DashboardMetrics, DashboardMetrics> {
		Selection::new(self.metrics.clone(), DashboardMetrics::clone)
	}

	pub fn metrics(&self) -> DashboardMetrics {
		self.metrics.borrow().clone()
	}

	/// Claims `order_id` for `partner_id` with a fresh idempotency token.
	pub async fn request_assignment(
		&self,
		order_id: impl Into<OrderId>,
		partner_id: impl Into<PartnerId>,
	) -> Result<AssignmentResult, SyncError> {
		self.request_assignment_with_token(order_id, partner_id, None)
			.await
	}

	/// Claims an order, reusing `token` when retrying an earlier request.
	pub async fn request_assignment_with_token(
		&self,
		order_id: impl Into<OrderId>,
		partner_id: impl Into<PartnerId>,
		token: Option<String>,
	) -> Result<AssignmentResult, SyncError> {
		let (order_id, partner_id) = (order_id.into(), partner_id.into());
		self.request(|reply| Command::Assign {
			order_id,
			partner_id,
			token,
			reply,
		})
		.await
	}

	/// Moves an order to `status` through the backend.
	pub async fn request_transition(
		&self,
		order_id: impl Into<OrderId>,
		status: OrderStatus,
	) -> Result<Order, SyncError> {
		let order_id = order_id.into();
		self.request(|reply| Command::Transition {
			order_id,
			status,
			reply,
		})
		.await
	}

	/// Creates an order. Manager clients only.
	pub async fn submit_order(&self, order: NewOrder) -> Result<Order, SyncError> {
		self.request(|reply| Command::Submit { order, reply }).await
	}

	/// Forces a full pull and waits for it to be reconciled.
	pub async fn refresh(&self) -> Result<ReconcileReport, SyncError> {
		self.request(|reply| Command::Refresh { reply }).await
	}

	/// Assignment intents still awaiting confirmation.
	pub async fn pending_overlays(&self) -> Result<Vec<OverlayView>, SyncError> {
		self.request(|reply| Command::Overlays { reply }).await
	}

	/// Subscribes to engine notifications.
	pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
		self.bus.subscribe()
	}

	/// Asks the engine to stop. Returns once the request is queued.
	pub async fn shutdown(&self) -> Result<(), SyncError> {
		self.commands
			.send(Command::Shutdown)
			.await
			.map_err(|_| SyncError::EngineStopped)
	}

	async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
		let (reply, response) = oneshot::channel();
		self.commands
			.send(build(reply))
			.await
			.map_err(|_| SyncError::EngineStopped)?;
		response.await.map_err(|_| SyncError::EngineStopped)?
	}
}

/// A value derived from a watched source, yielding only real changes.
pub struct Selection<S, T> {
	/// Value at subscription time.
	pub initial: T,
	receiver: watch::Receiver<S>,
	selector: Box<dyn Fn(&S) -> T + Send + Sync>,
	last: T,
}

impl<S, T> Selection<S, T>
where
	T: Clone + PartialEq,
{
	fn new<F>(mut receiver: watch::Receiver<S>, selector: F) -> Self
	where
		F: Fn(&S) -> T + Send + Sync + 'static,
	{
		let initial = selector(&*receiver.borrow_and_update());
		Self {
			last: initial.clone(),
			initial,
			receiver,
			selector: Box::new(selector),
		}
	}

	/// Waits until the selected value differs from the last one returned.
	///
	/// Returns `None` once the engine has stopped.
	pub async fn changed(&mut self) -> Option<T> {
		loop {
			self.receiver.changed().await.ok()?;
			let next = (self.selector)(&*self.receiver.borrow_and_update());
			if next != self.last {
				self.last = next.clone();
				return Some(next);
			}
		}
	}

	/// The last value returned, or the initial one.
	pub fn current(&self) -> &T {
		&self.last
	}
}
