use crate::errors::RemoteError;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerStatus {
    pub status: Option<String>,
    pub error: Option<RemoteError>,
}

impl InstallerStatus {
    /// The error to display. Hidden once the status text has caught up with
    /// the error's message.
    pub fn visible_error(&self) -> Option<&RemoteError> {
        match (&self.error, &self.status) {
            (Some(error), Some(status)) if error.message == *status => None,
            (error, _) => error.as_ref(),
        }
    }
}

/// Latest status and error for one tracker, broadcast to any number of readers.
#[derive(Debug)]
pub struct StatusChannel {
    sender: watch::Sender<InstallerStatus>,
}

impl Default for StatusChannel {
    fn default() -> Self {
        let (sender, _) = watch::channel(InstallerStatus::default());
        Self { sender }
    }
}

impl StatusChannel {
    pub fn current(&self) -> InstallerStatus {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallerStatus> {
        self.sender.subscribe()
    }

    pub fn set_error(&self, error: RemoteError) {
        self.sender.send_modify(|current| current.error = Some(error));
    }

    pub fn clear_error(&self) {
        self.sender.send_if_modified(|current| current.error.take().is_some());
    }

    /// Applies what a successful poll reported. The embedded error replaces
    /// the current one, so a clean poll clears it.
    pub fn apply_report(&self, status: Option<String>, error: Option<RemoteError>) {
        self.sender.send_if_modified(|current| {
            let changed = current.error != error || (status.is_some() && current.status != status);
            if let Some(status) = status {
                current.status = Some(status);
            }
            current.error = error;
            changed
        });
    }
}
