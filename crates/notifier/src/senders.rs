use crate::models::{Contact, Event, Trigger};
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no sender is registered for contact type '{0}'")]
    UnknownContactType(String),
    #[error("sending to {contact_type} contact '{contact_id}' failed")]
    Send {
        contact_type: String,
        contact_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("sending to {contact_type} contact '{contact_id}' timed out after {timeout:?}")]
    Timeout {
        contact_type: String,
        contact_id: String,
        timeout: std::time::Duration,
    },
}

/// Sender delivers notifications to contacts of one contact type.
pub trait Sender: std::fmt::Debug + Send + Sync + 'static {
    fn send<'s>(
        &'s self,
        contact: &'s Contact,
        event: &'s Event,
        trigger: &'s Trigger,
        throttled: bool,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 's;

    /// Release any long-lived connections held by this Sender.
    /// Called once, after all workers have stopped.
    fn shutdown<'s>(&'s self) -> impl std::future::Future<Output = ()> + Send + 's {
        async {}
    }
}

/// ObjSafe is an object-safe and type-erased trait which is implemented for all Senders.
trait ObjSafe: std::fmt::Debug + Send + Sync + 'static {
    fn send<'s>(
        &'s self,
        contact: &'s Contact,
        event: &'s Event,
        trigger: &'s Trigger,
        throttled: bool,
    ) -> BoxFuture<'s, anyhow::Result<()>>;

    fn shutdown<'s>(&'s self) -> BoxFuture<'s, ()>;
}

impl<S: Sender> ObjSafe for S {
    fn send<'s>(
        &'s self,
        contact: &'s Contact,
        event: &'s Event,
        trigger: &'s Trigger,
        throttled: bool,
    ) -> BoxFuture<'s, anyhow::Result<()>> {
        Sender::send(self, contact, event, trigger, throttled).boxed()
    }

    fn shutdown<'s>(&'s self) -> BoxFuture<'s, ()> {
        Sender::shutdown(self).boxed()
    }
}

/// Registry maps contact types to their Senders.
#[derive(Debug, Clone)]
pub struct Registry {
    senders: BTreeMap<String, Arc<dyn ObjSafe>>,
    send_timeout: std::time::Duration,
}

impl Registry {
    pub fn new(send_timeout: std::time::Duration) -> Self {
        Self {
            senders: BTreeMap::new(),
            send_timeout,
        }
    }

    /// Register a Sender for the given contact type.
    pub fn register<S: Sender>(mut self, contact_type: impl Into<String>, sender: S) -> Self {
        let contact_type = contact_type.into();

        if self.senders.contains_key(&contact_type) {
            panic!("a Sender for contact type {contact_type:?} is already registered");
        }
        self.senders.insert(contact_type, Arc::new(sender));
        self
    }

    /// Verify that a Sender is registered for each of `contact_types`.
    pub fn require<'a>(
        &self,
        contact_types: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), Error> {
        for contact_type in contact_types {
            if !self.senders.contains_key(contact_type) {
                return Err(Error::UnknownContactType(contact_type.to_string()));
            }
        }
        Ok(())
    }

    /// Send a notification of `event` to `contact`, bounded by the send timeout.
    pub async fn send(
        &self,
        contact: &Contact,
        event: &Event,
        trigger: &Trigger,
        throttled: bool,
    ) -> Result<(), Error> {
        let Some(sender) = self.senders.get(&contact.type_) else {
            return Err(Error::UnknownContactType(contact.type_.clone()));
        };

        match tokio::time::timeout(
            self.send_timeout,
            sender.send(contact, event, trigger, throttled),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(Error::Send {
                contact_type: contact.type_.clone(),
                contact_id: contact.id.clone(),
                source,
            }),
            Err(_elapsed) => Err(Error::Timeout {
                contact_type: contact.type_.clone(),
                contact_id: contact.id.clone(),
                timeout: self.send_timeout,
            }),
        }
    }

    /// Shut down all registered Senders.
    pub async fn shutdown(&self) {
        for (contact_type, sender) in &self.senders {
            () = sender.shutdown().await;
            tracing::debug!(%contact_type, "sender shut down");
        }
    }
}

/// LogSender writes notifications to the log rather than delivering them.
#[derive(Debug, Default)]
pub struct LogSender;

impl Sender for LogSender {
    async fn send<'s>(
        &'s self,
        contact: &'s Contact,
        event: &'s Event,
        trigger: &'s Trigger,
        throttled: bool,
    ) -> anyhow::Result<()> {
        tracing::warn!(
            contact_type = %contact.type_,
            to = %contact.value,
            trigger_id = %trigger.id,
            trigger_name = %trigger.name,
            state = %event.state,
            old_state = %event.old_state,
            throttled,
            "skipping delivery of notification (log sender)"
        );
        Ok(())
    }
}
