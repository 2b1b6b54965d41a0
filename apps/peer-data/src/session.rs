use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use signal_bus::Subscription;

use crate::channel::{validate_label, Channel};
use crate::config::SignalConfig;
use crate::error::Result;
use crate::negotiation::{Negotiator, PeerDirectory, PeerEvent};
use crate::rtc::{ConnectionFactory, LinkOptions, WebRtcFactory, WebRtcOptions};
use crate::signal::{
    HttpPollingTransport, OrderedSignal, RelayTransport, Signal, SignalMuxer, SignalState,
};

/// One participant in a room: the signal stack, its peers, and the channels opened over them.
pub struct PeerSession {
    muxer: Arc<SignalMuxer>,
    negotiator: Negotiator,
    channels: Mutex<HashMap<String, Channel>>,
}

impl PeerSession {
    /// Wire `transport` through ordering and muxing into a negotiator. Nothing is opened yet.
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        factory: Arc<dyn ConnectionFactory>,
        config: &SignalConfig,
    ) -> Self {
        let ordered: Arc<dyn Signal> = Arc::new(OrderedSignal::from_config(transport, config));
        let muxer = Arc::new(SignalMuxer::new(ordered));
        let negotiator = Negotiator::new(muxer.clone(), factory);
        muxer.attach(&negotiator);
        Self {
            muxer,
            negotiator,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Join the configured room over HTTP polling with WebRTC peer connections.
    pub async fn connect(config: &SignalConfig) -> Result<Self> {
        let transport = Arc::new(HttpPollingTransport::new(config)?);
        let factory = Arc::new(WebRtcFactory::new(WebRtcOptions {
            disable_stun: config.disable_stun,
            ..Default::default()
        }));
        let session = Self::new(transport, factory, config);
        session.open().await?;
        Ok(session)
    }

    /// Open the signal unless it already left `New`.
    pub async fn open(&self) -> Result<()> {
        if self.muxer.state() != SignalState::New {
            tracing::debug!(target = "signal", state = %self.muxer.state(), "signal already opened");
            return Ok(());
        }
        self.muxer.open().await
    }

    /// The channel for `label`, created and opened on first use.
    pub async fn channel(&self, label: &str) -> Result<Channel> {
        self.channel_with(label, LinkOptions::default()).await
    }

    /// Like [`PeerSession::channel`]; `options` only apply when the channel is created.
    pub async fn channel_with(&self, label: &str, options: LinkOptions) -> Result<Channel> {
        validate_label(label)?;
        let created = {
            let mut channels = self.channels.lock();
            if let Some(channel) = channels.get(label) {
                return Ok(channel.clone());
            }
            let channel = Channel::new(label, &self.negotiator, options)?;
            channels.insert(label.to_string(), channel.clone());
            channel
        };
        created.open().await?;
        Ok(created)
    }

    pub fn signal_state(&self) -> SignalState {
        self.muxer.state()
    }

    pub fn local_peer(&self) -> Option<String> {
        self.negotiator.local_peer()
    }

    pub fn peers(&self) -> PeerDirectory {
        self.negotiator.peers()
    }

    pub fn subscribe(&self) -> Subscription<PeerEvent> {
        self.negotiator.subscribe()
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn muxer(&self) -> &Arc<SignalMuxer> {
        &self.muxer
    }

    /// Close every channel, then the signal and all peer connections.
    pub async fn close(&self) -> Result<()> {
        let channels: Vec<Channel> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            if let Err(err) = channel.close().await {
                tracing::debug!(target = "channel", label = %channel.label(), error = %err, "channel already closed");
            }
        }
        self.negotiator.close().await
    }
}
