use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::{ChannelId, ChannelOpenFailure, Error, Sig};

/// Possible messages that [Channel::wait] can receive, plus the requests
/// a channel can send through the event loop.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelMsg {
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    Data {
        data: Vec<u8>,
    },
    ExtendedData {
        data: Vec<u8>,
        ext: u32,
    },
    Eof,
    Close,
    /// (client only)
    RequestPty {
        want_reply: bool,
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    /// (client only)
    RequestShell {
        want_reply: bool,
    },
    /// (client only)
    Exec {
        want_reply: bool,
        command: Vec<u8>,
    },
    /// (client only)
    Signal {
        signal: Sig,
    },
    /// (client only)
    RequestSubsystem {
        want_reply: bool,
        name: String,
    },
    /// (client only)
    SetEnv {
        want_reply: bool,
        variable_name: String,
        variable_value: String,
    },
    /// (client only)
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    /// The server granted us more send window.
    WindowAdjusted {
        new_size: u32,
    },
    /// Control-S/control-Q flow control permission,
    /// https://tools.ietf.org/html/rfc4254#section-6.8
    XonXoff {
        client_can_do: bool,
    },
    /// The remote process exited with this status.
    ExitStatus {
        exit_status: u32,
    },
    /// The remote process exited upon a signal.
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    /// Reply to a request with `want_reply`, matched in FIFO order.
    Success,
    Failure,
    OpenFailure(ChannelOpenFailure),
}

/// A handle to a session channel.
///
/// Reads and writes go through the session's event loop, which enforces
/// the peer's flow-control window; writes past the window are queued
/// there and drain as WINDOW_ADJUST credit arrives.
pub struct Channel<S: From<(ChannelId, ChannelMsg)>> {
    pub(crate) id: ChannelId,
    pub(crate) sender: Sender<S>,
    pub(crate) receiver: UnboundedReceiver<ChannelMsg>,
    pub(crate) max_packet_size: u32,
    pub(crate) window_size: u32,
}

impl<S: From<(ChannelId, ChannelMsg)>> std::fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl<S: From<(ChannelId, ChannelMsg)> + Send + 'static> Channel<S> {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The maximum packet size the peer accepts on this channel.
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// The peer's initial receive window.
    pub fn initial_window_size(&self) -> u32 {
        self.window_size
    }

    /// Request a pseudo-terminal with the given characteristics.
    pub async fn request_pty(
        &self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestPty {
            want_reply,
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
        })
        .await
    }

    /// Request a remote shell.
    pub async fn request_shell(&self, want_reply: bool) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestShell { want_reply }).await
    }

    /// Execute a remote program (will be passed to a shell).
    pub async fn exec<A: Into<Vec<u8>>>(&self, want_reply: bool, command: A) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Exec {
            want_reply,
            command: command.into(),
        })
        .await
    }

    /// Signal a remote process.
    pub async fn signal(&self, signal: Sig) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Signal { signal }).await
    }

    /// Request the start of a subsystem with the given name.
    pub async fn request_subsystem<A: Into<String>>(
        &self,
        want_reply: bool,
        name: A,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::RequestSubsystem {
            want_reply,
            name: name.into(),
        })
        .await
    }

    /// Set a remote environment variable.
    pub async fn set_env<A: Into<String>, B: Into<String>>(
        &self,
        want_reply: bool,
        variable_name: A,
        variable_value: B,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::SetEnv {
            want_reply,
            variable_name: variable_name.into(),
            variable_value: variable_value.into(),
        })
        .await
    }

    /// Inform the server that our window size has changed.
    pub async fn window_change(
        &self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.send_msg(ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        })
        .await
    }

    /// Send data on the channel. Bytes are delivered to the peer in
    /// order; anything beyond the current window is queued by the event
    /// loop.
    pub async fn data<A: Into<Vec<u8>>>(&self, data: A) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Data { data: data.into() }).await
    }

    /// Send extended data (stream 1 is stderr).
    pub async fn extended_data<A: Into<Vec<u8>>>(&self, ext: u32, data: A) -> Result<(), Error> {
        self.send_msg(ChannelMsg::ExtendedData {
            ext,
            data: data.into(),
        })
        .await
    }

    /// Signal that we will send no more data. We may still receive.
    pub async fn eof(&self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Eof).await
    }

    /// Request that the channel be closed.
    pub async fn close(&self) -> Result<(), Error> {
        self.send_msg(ChannelMsg::Close).await
    }

    async fn send_msg(&self, msg: ChannelMsg) -> Result<(), Error> {
        self.sender
            .send((self.id, msg).into())
            .await
            .map_err(|_| Error::SendError)
    }

    /// Awaits an incoming [`ChannelMsg`]; returns [`None`] once the
    /// channel is closed.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        self.receiver.recv().await
    }
}
