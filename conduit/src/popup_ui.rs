//! The popup (or fullscreen) UI context at its messaging boundary.
//!
//! What the user sees and approves lives outside this crate; a [`PopupUi`]
//! only maps each republished message type to the handler deciding the
//! answer, announces itself with `PopupReady` once mounted, and replies.

use crate::browser::WindowId;
use crate::envelope::{Envelope, ErrorReply, Message, MessageType};
use crate::error::TransportResult;
use crate::handle::ContextHandle;
use crate::hub::Handler;
use crate::transport::{ExtensionRuntime, RuntimeListener, RuntimePort, RuntimeRequest};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// An extension page answering the requests the background hands it.
#[derive(Clone)]
pub struct PopupUi {
    runtime: ExtensionRuntime,
    handlers: HashMap<MessageType, Handler>,
    window: Option<WindowId>,
    single_shot: bool,
}

impl std::fmt::Debug for PopupUi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopupUi")
            .field("handles", &self.handlers.keys().collect::<Vec<_>>())
            .field("window", &self.window)
            .field("single_shot", &self.single_shot)
            .finish_non_exhaustive()
    }
}

impl PopupUi {
    /// A popup that closes after answering one request.
    #[must_use]
    pub fn new(runtime: &ExtensionRuntime) -> Self {
        Self {
            runtime: runtime.clone(),
            handlers: HashMap::new(),
            window: None,
            single_shot: true,
        }
    }

    /// Answer `message_type` with `handler`.
    #[must_use]
    pub fn on(mut self, message_type: MessageType, handler: Handler) -> Self {
        self.handlers.insert(message_type, handler);
        self
    }

    /// Load the UI into popup `window`, so it only receives what the
    /// background sends to that window.
    #[must_use]
    pub const fn in_window(mut self, window: WindowId) -> Self {
        self.window = Some(window);
        self
    }

    /// Keep answering until stopped, like a fullscreen UI tab.
    #[must_use]
    pub const fn persistent(mut self) -> Self {
        self.single_shot = false;
        self
    }

    /// Attach the listener, then tell the background the UI is ready.
    ///
    /// # Errors
    ///
    /// Returns the transport error if `PopupReady` could not be delivered;
    /// the listener is torn down in that case.
    pub async fn mount(self) -> TransportResult<ContextHandle> {
        let listener = match self.window {
            Some(window) => self.runtime.listen_window(window),
            None => self.runtime.listen_page(),
        };
        let port = self.runtime.page_port();
        let handle = ContextHandle::spawn("popup-ui", move |mut shutdown| async move {
            self.serve(listener, &mut shutdown).await;
        });

        let ready = Envelope::from(Message::new(MessageType::PopupReady)).to_value();
        if let Err(e) = port.send_message(ready).await {
            warn!(error = %e, "popup could not announce itself");
            handle.abort();
            return Err(e);
        }
        debug!("popup mounted");
        Ok(handle)
    }

    async fn serve(
        self,
        mut listener: RuntimeListener,
        shutdown: &mut tokio::sync::mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                request = listener.recv() => {
                    let Some(request) = request else { break };
                    if self.answer(request).await && self.single_shot {
                        debug!("request answered, popup closing");
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Returns whether the request was answered.
    async fn answer(&self, request: RuntimeRequest) -> bool {
        let RuntimeRequest {
            envelope,
            sender,
            responder,
        } = request;
        let Some(Envelope::Message(message)) = Envelope::from_value(&envelope) else {
            trace!("popup ignoring foreign traffic");
            return false;
        };
        let Some(handler) = self.handlers.get(&message.message_type) else {
            debug!(message_type = %message.message_type, "popup has no handler");
            return false;
        };

        let id = message.correlation_id;
        let reply = match handler(message.clone(), sender).await {
            Ok(payload) => Envelope::from(message.respond(payload)),
            Err(e) => Envelope::from(ErrorReply::new(id, e.to_string())),
        };
        responder.respond(reply.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HubError, TransportError};
    use crate::filter;
    use crate::hub::handler_fn;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_mount_announces_ready_then_answers_once() {
        let runtime = ExtensionRuntime::new();
        let mut background = runtime.listen_background();

        let popup = PopupUi::new(&runtime).on(
            MessageType::SignData,
            handler_fn(|msg, _| async move {
                let data: String = msg
                    .payload_as()
                    .map_err(|e| HubError::InvalidPayload(e.to_string()))?;
                Ok(json!(format!("sig({data})")))
            }),
        );

        let mount = tokio::spawn(popup.mount());
        let ready = background.recv().await.unwrap();
        assert_eq!(filter::message_type_of(&ready.envelope), Some(MessageType::PopupReady));
        ready.responder.respond(Value::Null);
        let handle = mount.await.unwrap().unwrap();

        let port = runtime.background_port();
        let msg = Message::new(MessageType::SignData).with_payload(json!("hello"));
        let reply = port.send_message(Envelope::from(msg.clone()).to_value()).await.unwrap();
        assert_eq!(
            Envelope::from_value(&reply),
            Some(Envelope::from(msg.respond(json!("sig(hello)"))))
        );

        handle.join().await;
        let again = port
            .send_message(Envelope::from(Message::new(MessageType::SignData)).to_value())
            .await;
        assert_eq!(again, Err(TransportError::NoReceiver));
    }

    #[tokio::test]
    async fn test_handler_failure_answers_error() {
        let runtime = ExtensionRuntime::new();
        let mut background = runtime.listen_background();
        tokio::spawn(async move {
            while let Some(req) = background.recv().await {
                req.responder.respond(Value::Null);
            }
        });

        let handle = PopupUi::new(&runtime)
            .on(
                MessageType::Connect,
                handler_fn(|_, _| async { Err(HubError::handler("user declined")) }),
            )
            .persistent()
            .mount()
            .await
            .unwrap();

        let msg = Message::new(MessageType::Connect);
        let reply = runtime
            .background_port()
            .send_message(Envelope::from(msg.clone()).to_value())
            .await
            .unwrap();
        assert!(filter::is_error(&reply));
        assert_eq!(reply["error"], "user declined");
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_windowed_popup_ignores_other_windows() {
        let runtime = ExtensionRuntime::new();
        let mut background = runtime.listen_background();
        tokio::spawn(async move {
            while let Some(req) = background.recv().await {
                req.responder.respond(Value::Null);
            }
        });

        let handle = PopupUi::new(&runtime)
            .on(MessageType::Connect, handler_fn(|_, _| async { Ok(json!(["0x1"])) }))
            .in_window(9)
            .mount()
            .await
            .unwrap();

        let msg = Envelope::from(Message::new(MessageType::Connect)).to_value();
        let elsewhere = runtime.window_port(8).send_message(msg.clone()).await;
        assert_eq!(elsewhere, Err(TransportError::NoReceiver));

        let reply = runtime.window_port(9).send_message(msg).await.unwrap();
        assert!(filter::is_response(&reply));
        handle.join().await;
    }

    #[tokio::test]
    async fn test_mount_without_background_fails() {
        let runtime = ExtensionRuntime::new();
        let res = PopupUi::new(&runtime).mount().await;
        assert!(matches!(res, Err(TransportError::NoReceiver)));
    }
}
