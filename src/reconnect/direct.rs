//! Direct client actor: a [`Coordinator`] over real WebSocket transports.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::client::{ClientCommand, ClientHandle, ClientKind};
use crate::clock::{now, sleep_until_deadline};
use crate::events::{ClientEvent, EventDispatcher};
use crate::transport::{TransportConfig, TransportEvent, WsDialer};

use super::coordinator::{Coordinator, CoordinatorConfig};

/// Spawns a direct client for `url`.
///
/// The client is idle until it receives `Connect`. Must be called within a
/// Tokio runtime.
pub fn spawn_direct(
    url: Url,
    transport: TransportConfig,
    config: CoordinatorConfig,
) -> ClientHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let events = Arc::new(EventDispatcher::new());

    debug!(%url, "Spawning direct client");
    let dialer = WsDialer::new(url, transport, events_tx);
    let coordinator = Coordinator::new(dialer, config, Arc::clone(&events));

    tokio::spawn(run(
        coordinator,
        Arc::clone(&events),
        commands_rx,
        events_rx,
    ));

    ClientHandle::new(ClientKind::Direct, commands_tx, events)
}

async fn run(
    mut coordinator: Coordinator<WsDialer>,
    events: Arc<EventDispatcher<ClientEvent>>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        let deadline = coordinator.next_deadline();

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                trace!(?command, "Direct client command");

                match command {
                    ClientCommand::Verify => events.emit(&ClientEvent::Verified),
                    ClientCommand::Connect => coordinator.connect(),
                    ClientCommand::Subscribe { topic, credential, listener, completion } => {
                        coordinator.subscribe(&topic, &credential, listener, completion, now());
                    }
                    ClientCommand::Unsubscribe { topic, listener, completion } => {
                        coordinator.unsubscribe(&topic, listener, completion, now());
                    }
                    ClientCommand::Inject { topic, payload } => {
                        coordinator.inject(&topic, &payload);
                    }
                    ClientCommand::Shutdown => break,
                }
            }

            Some(event) = transport_events.recv() => {
                coordinator.handle(event, now());
            }

            () = sleep_until_deadline(deadline) => {
                coordinator.expire(now());
            }
        }
    }

    coordinator.shutdown();
    commands.close();
    while let Ok(command) = commands.try_recv() {
        command.reject();
    }
    debug!("Direct client stopped");
}
