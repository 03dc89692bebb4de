use crate::Core::alloc::SendBuffer;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Buffer-acquisition capability: an exclusively owned frame, or `None` on timeout.
pub type GetBuffFn = Arc<dyn Fn(Duration) -> Option<SendBuffer> + Send + Sync>;

/// Called after a channel's buffer has been committed.
pub type PostSendFn = Arc<dyn Fn() + Send + Sync>;

/// Per-channel configuration.
#[derive(Clone, Default)]
pub struct ChannelBinding {
    pub(crate) get_buff: Option<GetBuffFn>,
    pub(crate) post_send: Option<PostSendFn>,
    pub(crate) has_sid: bool,
    pub(crate) sid: u32,
}

impl ChannelBinding {
    pub fn has_get_buff(&self) -> bool {
        self.get_buff.is_some()
    }

    pub fn has_post_send(&self) -> bool {
        self.post_send.is_some()
    }

    /// Stream id embedded in this channel's headers, if any.
    pub fn sid(&self) -> Option<u32> {
        self.has_sid.then_some(self.sid)
    }
}

/// Channel Binding Table, indexed by transport channel.
#[derive(Clone, Default)]
pub struct ChannelTable {
    bindings: Vec<ChannelBinding>,
}

impl ChannelTable {
    pub fn new(num_channels: usize) -> Self {
        Self {
            bindings: vec![ChannelBinding::default(); num_channels],
        }
    }

    /// Grow or shrink the table; surviving channels keep their bindings.
    pub fn resize(&mut self, num_channels: usize) {
        self.bindings.resize(num_channels, ChannelBinding::default());
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn get(&self, channel: usize) -> Option<&ChannelBinding> {
        self.bindings.get(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelBinding> {
        self.bindings.iter()
    }

    fn get_mut(&mut self, channel: usize) -> io::Result<&mut ChannelBinding> {
        let len = self.bindings.len();
        self.bindings.get_mut(channel).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Channel index {} out of range (0..{})", channel, len),
            )
        })
    }

    pub fn set_get_buff(&mut self, channel: usize, get_buff: GetBuffFn) -> io::Result<()> {
        self.get_mut(channel)?.get_buff = Some(get_buff);
        Ok(())
    }

    pub fn set_post_send(&mut self, channel: usize, cb: PostSendFn) -> io::Result<()> {
        self.get_mut(channel)?.post_send = Some(cb);
        Ok(())
    }

    pub fn set_sid(&mut self, channel: usize, has_sid: bool, sid: u32) -> io::Result<()> {
        let binding = self.get_mut(channel)?;
        binding.has_sid = has_sid;
        binding.sid = sid;
        Ok(())
    }

    /// First channel without a buffer provider.
    pub fn first_unbound(&self) -> Option<usize> {
        self.bindings.iter().position(|b| b.get_buff.is_none())
    }
}

impl std::fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_channel_binding(self, f)
    }
}

impl std::fmt::Debug for ChannelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.bindings.iter()).finish()
    }
}
