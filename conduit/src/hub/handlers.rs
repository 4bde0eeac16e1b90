//! Built-in background handlers: page-script injection and popup prompts.

use super::{BackgroundHub, HubInner, handler_fn};
use crate::browser::WindowId;
use crate::envelope::{Message, MessageType};
use crate::error::{HubError, HubResult};
use crate::popup::placement;
use crate::transport::MessageSender;
use serde_json::Value;
use std::sync::{Mutex, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

fn upgrade(weak: &Weak<HubInner>) -> HubResult<BackgroundHub> {
    BackgroundHub::upgrade(weak).ok_or_else(|| HubError::handler("background hub shut down"))
}

/// Register `Init` and one prompt handler per prompt-requiring type.
pub(super) fn install(hub: &BackgroundHub) {
    let weak = hub.downgrade();
    hub.subscribe(
        MessageType::Init,
        handler_fn(move |_, sender| {
            let weak = weak.clone();
            async move { inject(&upgrade(&weak)?, sender).await }
        }),
    );

    for message_type in MessageType::ALL.into_iter().filter(|t| t.requires_prompt()) {
        let weak = hub.downgrade();
        hub.subscribe(
            message_type,
            handler_fn(move |message, _| {
                let weak = weak.clone();
                async move { prompt(&upgrade(&weak)?, message).await }
            }),
        );
    }
}

/// Inject the page script on the first `Init` of the session.
///
/// Answers `true` when this call injected, `false` when it was a no-op.
async fn inject(hub: &BackgroundHub, sender: MessageSender) -> HubResult<Value> {
    if !hub.config().inject_on_init {
        debug!("page script injection disabled");
        return Ok(Value::Bool(false));
    }
    if !hub.session().begin_injection() {
        debug!("page script already injected this session");
        return Ok(Value::Bool(false));
    }

    let injected = async {
        let tab = match sender.tab {
            Some(tab) => tab,
            None => hub.browser().active_tab().await?,
        };
        hub.browser().inject_page_script(tab.id).await?;
        Ok::<_, HubError>(tab.id)
    }
    .await;

    match injected {
        Ok(tab) => {
            info!(tab, "page script loaded");
            Ok(Value::Bool(true))
        }
        Err(e) => {
            hub.session().abort_injection();
            warn!(error = %e, "page script injection failed");
            Err(e)
        }
    }
}

/// Open a popup, wait for its `PopupReady`, then hand it the message.
///
/// Only one popup handshake runs at a time; later prompts queue on the gate.
/// Closing the window at any point fails the prompt with
/// [`HubError::PopupClosed`] and lets the next queued prompt proceed.
async fn prompt(hub: &BackgroundHub, message: Message) -> HubResult<Value> {
    let turn = hub.session().popup_gate().acquire().await;

    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let ready_tx = Mutex::new(Some(ready_tx));
    let ready = hub.handle_once(
        MessageType::PopupReady,
        handler_fn(move |_, _| {
            if let Some(tx) = ready_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(());
            }
            async { Ok(Value::Null) }
        }),
    );

    let window = match open_popup(hub).await {
        Ok(window) => window,
        Err(e) => {
            hub.unsubscribe(MessageType::PopupReady, ready);
            warn!(id = %message.correlation_id, error = %e, "popup could not be opened");
            return Err(e);
        }
    };

    let mut closed = hub.browser().window_closed(window);
    tokio::select! {
        biased;
        res = ready_rx => res.map_err(|_| HubError::PopupClosed)?,
        () = &mut closed => {
            hub.unsubscribe(MessageType::PopupReady, ready);
            warn!(window, id = %message.correlation_id, "popup closed before it was ready");
            return Err(HubError::PopupClosed);
        }
    }
    drop(turn);

    let id = message.correlation_id;
    debug!(window, %id, message_type = %message.message_type, "popup ready");
    tokio::select! {
        biased;
        res = hub.publish_to_window(window, message) => res,
        () = closed => {
            warn!(window, %id, "popup closed before answering");
            Err(HubError::PopupClosed)
        }
    }
}

async fn open_popup(hub: &BackgroundHub) -> HubResult<WindowId> {
    let bounds = hub.browser().last_focused_window().await?;
    let spec = placement(bounds, &hub.config().popup);
    let window = hub.browser().create_popup(spec).await?;
    hub.record(|s| s.popups_opened += 1);
    Ok(window)
}
