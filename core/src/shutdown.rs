//! Cooperative shutdown coordination.
//!
//! A [`Controller`] is cloned into every long-running task. Triggering it
//! wakes all `triggered_shutdown` futures; completion additionally waits
//! until every [`DelayToken`] has been dropped, which lets endpoints finish
//! the write they are in before the process exits.

use std::{
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex},
	task::{Context, Poll, Waker},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShutdownError {
	#[error("shutdown is already in progress")]
	AlreadyTriggered,
}

pub struct ControllerInner<T> {
	delay_tokens: usize,
	reason: Option<T>,
	on_trigger: Vec<Waker>,
	on_complete: Vec<Waker>,
}

/// Clonable shutdown handle carrying the reason of type `T`.
pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Clone for Controller<T> {
	fn clone(&self) -> Self {
		Controller {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Controller {
			inner: Arc::new(Mutex::new(ControllerInner {
				delay_tokens: 0,
				reason: None,
				on_trigger: Vec::new(),
				on_complete: Vec::new(),
			})),
		}
	}

	/// Starts the shutdown. Fails if one is already in progress.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownError> {
		let mut inner = self.inner.lock().expect("shutdown lock poisoned");
		if inner.reason.is_some() {
			return Err(ShutdownError::AlreadyTriggered);
		}
		inner.reason = Some(reason);
		for waker in inner.on_trigger.drain(..) {
			waker.wake();
		}
		// completion may already be reachable when no tokens are out
		for waker in inner.on_complete.drain(..) {
			waker.wake();
		}
		Ok(())
	}

	pub fn is_triggered(&self) -> bool {
		self.inner
			.lock()
			.expect("shutdown lock poisoned")
			.reason
			.is_some()
	}

	/// A token that delays shutdown completion until it is dropped.
	pub fn delay_token(&self) -> DelayToken<T> {
		let mut inner = self.inner.lock().expect("shutdown lock poisoned");
		inner.delay_tokens += 1;
		DelayToken {
			inner: self.inner.clone(),
		}
	}

	/// Completes with the reason once shutdown has been triggered.
	pub fn triggered_shutdown(&self) -> Triggered<T> {
		Triggered {
			inner: self.inner.clone(),
		}
	}

	/// Completes once shutdown was triggered *and* every delay token is
	/// gone.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Races `future` against the shutdown trigger; `None` means the
	/// shutdown won.
	pub fn with_cancel<F: Future>(&self, future: F) -> impl Future<Output = Option<F::Output>> {
		let triggered = self.triggered_shutdown();
		async move {
			tokio::select! {
				_ = triggered => None,
				output = future => Some(output),
			}
		}
	}
}

/// Keeps shutdown from completing while alive.
pub struct DelayToken<T> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T> Clone for DelayToken<T> {
	fn clone(&self) -> Self {
		let mut inner = self.inner.lock().expect("shutdown lock poisoned");
		inner.delay_tokens += 1;
		DelayToken {
			inner: self.inner.clone(),
		}
	}
}

impl<T> Drop for DelayToken<T> {
	fn drop(&mut self) {
		let mut inner = self.inner.lock().expect("shutdown lock poisoned");
		inner.delay_tokens -= 1;
		if inner.delay_tokens == 0 && inner.reason.is_some() {
			for waker in inner.on_complete.drain(..) {
				waker.wake();
			}
		}
	}
}

/// Future resolving with the shutdown reason as soon as it is triggered.
pub struct Triggered<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Triggered<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().expect("shutdown lock poisoned");
		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}
		inner.on_trigger.push(cx.waker().clone());
		Poll::Pending
	}
}

/// Future resolving once shutdown is both triggered and fully drained.
pub struct Completed<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = self.inner.lock().expect("shutdown lock poisoned");
		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}
		inner.on_complete.push(cx.waker().clone());
		Poll::Pending
	}
}

/// Completes upon SIGINT or, on unix, SIGTERM.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let terminate = async {
			let mut signal =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			signal.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = terminate => {},
		}
	}

	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
