/// Watchdog command bus
///
/// Every outbound cluster command gets a monotonically increasing
/// command id and a per-recipient result row. A command completes
/// when every recipient that was actually sent to has replied, when
/// its deadline passes, or when any peer answers Reject or Error.
use std::time::{Duration, Instant};

use super::packet::PacketType;

/// Per-recipient delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeResultState {
    Init,
    Sent,
    Replied,
    SendError,
    DoNotSend,
}

#[derive(Debug, Clone)]
pub struct NodeResult {
    pub peer_id: usize,
    pub state: NodeResultState,
    pub reply_type: Option<PacketType>,
}

/// Terminal and non-terminal command states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    InProgress,
    FinishedAllReplied,
    FinishedTimeout,
    FinishedRejected,
    FinishedError,
}

impl CommandStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, CommandStatus::InProgress)
    }

    /// Whether the command counts as carried by the cluster: every
    /// reached peer accepted, or nobody contradicted before timeout
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            CommandStatus::FinishedAllReplied | CommandStatus::FinishedTimeout
        )
    }
}

/// One in-flight cluster command
#[derive(Debug, Clone)]
pub struct ClusterCommand {
    pub command_id: u32,
    pub packet_type: PacketType,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub results: Vec<NodeResult>,
    pub status: CommandStatus,
}

impl ClusterCommand {
    fn new(
        command_id: u32,
        packet_type: PacketType,
        recipients: &[usize],
        timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            command_id,
            packet_type,
            issued_at: now,
            deadline: now + timeout,
            results: recipients
                .iter()
                .map(|peer_id| NodeResult {
                    peer_id: *peer_id,
                    state: NodeResultState::Init,
                    reply_type: None,
                })
                .collect(),
            status: CommandStatus::InProgress,
        }
    }

    fn row_mut(&mut self, peer_id: usize) -> Option<&mut NodeResult> {
        self.results.iter_mut().find(|r| r.peer_id == peer_id)
    }

    /// Re-evaluate the completion condition
    fn refresh_status(&mut self) {
        if self.status.is_finished() {
            return;
        }
        if self.results.iter().any(|r| {
            matches!(r.reply_type, Some(PacketType::Reject))
        }) {
            self.status = CommandStatus::FinishedRejected;
            return;
        }
        if self.results.iter().any(|r| {
            matches!(r.reply_type, Some(PacketType::Error))
        }) {
            self.status = CommandStatus::FinishedError;
            return;
        }
        let outstanding = self.results.iter().any(|r| {
            !matches!(
                r.state,
                NodeResultState::Replied | NodeResultState::DoNotSend | NodeResultState::SendError
            )
        });
        if !outstanding {
            self.status = CommandStatus::FinishedAllReplied;
        }
    }
}

/// Tracks all in-flight commands and allocates command ids
pub struct CommandBus {
    next_id: u32,
    inflight: Vec<ClusterCommand>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            // Id zero is reserved for untracked messages
            next_id: 1,
            inflight: Vec::new(),
        }
    }

    pub fn next_command_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Begin tracking a command toward `recipients`
    pub fn issue(
        &mut self,
        packet_type: PacketType,
        recipients: &[usize],
        timeout: Duration,
        now: Instant,
    ) -> u32 {
        let command_id = self.next_command_id();
        let mut command = ClusterCommand::new(command_id, packet_type, recipients, timeout, now);
        if recipients.is_empty() {
            command.status = CommandStatus::FinishedAllReplied;
        }
        self.inflight.push(command);
        command_id
    }

    pub fn record_sent(&mut self, command_id: u32, peer_id: usize) {
        if let Some(cmd) = self.get_mut(command_id) {
            if let Some(row) = cmd.row_mut(peer_id) {
                row.state = NodeResultState::Sent;
            }
        }
    }

    /// The peer could not be reached; it no longer gates completion
    pub fn record_send_error(&mut self, command_id: u32, peer_id: usize) -> Option<CommandStatus> {
        let cmd = self.get_mut(command_id)?;
        if let Some(row) = cmd.row_mut(peer_id) {
            row.state = NodeResultState::SendError;
        }
        cmd.refresh_status();
        Some(cmd.status)
    }

    /// Route a reply frame to its command. Returns the command status
    /// after the reply when the id was tracked.
    pub fn on_reply(
        &mut self,
        command_id: u32,
        peer_id: usize,
        reply_type: PacketType,
    ) -> Option<CommandStatus> {
        let cmd = self.get_mut(command_id)?;
        if let Some(row) = cmd.row_mut(peer_id) {
            row.state = NodeResultState::Replied;
            row.reply_type = Some(reply_type);
        }
        cmd.refresh_status();
        Some(cmd.status)
    }

    /// Expire overdue commands; returns their (id, type) pairs
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<(u32, PacketType)> {
        let mut expired = Vec::new();
        for cmd in self.inflight.iter_mut() {
            if !cmd.status.is_finished() && now >= cmd.deadline {
                cmd.status = CommandStatus::FinishedTimeout;
                expired.push((cmd.command_id, cmd.packet_type));
            }
        }
        self.gc();
        expired
    }

    /// A peer was lost: commands waiting on it stop waiting. Returns
    /// commands that completed because of it.
    pub fn cancel_for_peer(&mut self, peer_id: usize) -> Vec<(u32, CommandStatus)> {
        let mut completed = Vec::new();
        for cmd in self.inflight.iter_mut() {
            if cmd.status.is_finished() {
                continue;
            }
            if let Some(row) = cmd.row_mut(peer_id) {
                if !matches!(row.state, NodeResultState::Replied) {
                    row.state = NodeResultState::DoNotSend;
                }
            }
            cmd.refresh_status();
            if cmd.status.is_finished() {
                completed.push((cmd.command_id, cmd.status));
            }
        }
        completed
    }

    pub fn get(&self, command_id: u32) -> Option<&ClusterCommand> {
        self.inflight.iter().find(|c| c.command_id == command_id)
    }

    fn get_mut(&mut self, command_id: u32) -> Option<&mut ClusterCommand> {
        self.inflight.iter_mut().find(|c| c.command_id == command_id)
    }

    /// Drop finished commands, keeping the list bounded
    fn gc(&mut self) {
        self.inflight.retain(|c| !c.status.is_finished());
    }

    /// Forget a finished command once its completion is handled
    pub fn retire(&mut self, command_id: u32) {
        self.inflight.retain(|c| c.command_id != command_id);
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}
