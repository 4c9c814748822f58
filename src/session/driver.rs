//! # Session Driver Task
//!
//! One tokio task per session owns the transport and all protocol state;
//! callers talk to it through the command mailbox. The driver enforces
//! at-most-one request in flight, routes inbound flow control to the
//! transmitter before reassembly, and keeps three timers: the request
//! deadline, N_Bs while awaiting flow control, and N_Cr between
//! consecutive frames.
//!
//! Error policy: transport failures are fatal and park the driver in an
//! error state that fails every later request immediately; ISO-TP and
//! protocol failures cost only the exchange they interrupted.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::oneshot;
use tokio::time::{sleep, sleep_until, Instant};

use crate::constants::{ISOTP_FRAME_LEN, ISOTP_N_BS, NRC_RESPONSE_PENDING, UNMATCHED_MESSAGE_GRACE};
use crate::error::{IsoTpError, ObdError, ProtocolError, TransportError};
use crate::isotp::{
    decode_frame, pack_frame, AddressMode, FrameSlicer, InboundEvent, IsoTpFrame, Reassembler,
    Transmitter, TxAction,
};
use crate::obd::codec::{
    decode_response, encode_request, match_response, negative_response, DecodedValue, ObdRequest,
};
use crate::session::elm327::{
    classify_line, format_request, ElmEvent, ElmLine, LineBuffer, ResponseCollector,
};
use crate::session::{Command, SessionConfig};
use crate::transport::Transport;

/// Peer dialect, fixed at session start by the ATZ probe.
pub(crate) enum LinkMode {
    /// Binary ISO-TP frames over the byte channel.
    Raw {
        slicer: FrameSlicer,
        reassembler: Reassembler,
        transmitter: Transmitter,
    },
    /// ELM327 text mode; the adapter owns CAN-side flow control.
    Elm {
        lines: LineBuffer,
        collector: ResponseCollector,
    },
}

impl LinkMode {
    pub(crate) fn raw(config: &SessionConfig) -> Self {
        LinkMode::Raw {
            slicer: FrameSlicer::new(),
            reassembler: Reassembler::new(config.block_size, config.st_min),
            transmitter: Transmitter::new(config.address_mode),
        }
    }

    pub(crate) fn elm() -> Self {
        LinkMode::Elm {
            lines: LineBuffer::new(),
            collector: ResponseCollector::new(),
        }
    }
}

pub(crate) enum Reply {
    Decoded(oneshot::Sender<Result<DecodedValue, ObdError>>),
    Raw(oneshot::Sender<Result<Vec<u8>, ObdError>>),
}

impl Reply {
    fn fail(self, err: ObdError) {
        match self {
            Reply::Decoded(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::Raw(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct Pending {
    /// `None` for raw passthrough requests.
    request: Option<ObdRequest>,
    reply: Reply,
    deadline: Instant,
}

enum Outcome {
    Message(Vec<u8>),
    Tx(TxAction),
    WriteFc(IsoTpFrame),
    IsoTp(IsoTpError),
    Protocol(ProtocolError),
}

enum Event {
    Command(Option<Command>),
    Inbound(Result<bytes::Bytes, TransportError>),
    Timer,
}

pub(crate) struct Driver {
    transport: Box<dyn Transport>,
    config: SessionConfig,
    mode: LinkMode,
    commands: tokio::sync::mpsc::Receiver<Command>,
    pending: Option<Pending>,
    /// Responses that arrived with nothing in flight, kept briefly so a
    /// racing request can still claim them.
    unmatched: VecDeque<(Vec<u8>, std::time::Instant)>,
    /// N_Bs: armed while the transmitter awaits flow control.
    fc_deadline: Option<Instant>,
    error: Option<TransportError>,
}

impl Driver {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        mode: LinkMode,
        commands: tokio::sync::mpsc::Receiver<Command>,
    ) -> Self {
        Driver {
            transport,
            config,
            mode,
            commands,
            pending: None,
            unmatched: VecDeque::new(),
            fc_deadline: None,
            error: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("session driver started");
        loop {
            let deadline = self.next_deadline();
            let timer = sleep_until(deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)));
            tokio::pin!(timer);

            let event = {
                let Driver {
                    commands,
                    transport,
                    error,
                    ..
                } = &mut self;
                tokio::select! {
                    cmd = commands.recv() => Event::Command(cmd),
                    chunk = transport.recv(), if error.is_none() => Event::Inbound(chunk),
                    _ = &mut timer, if deadline.is_some() => Event::Timer,
                }
            };

            match event {
                Event::Command(None) => break,
                Event::Command(Some(cmd)) => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Event::Inbound(Ok(chunk)) => self.handle_inbound(&chunk).await,
                Event::Inbound(Err(e)) => self.fail_link(e),
                Event::Timer => self.handle_timers(),
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!("transport close on shutdown: {e}");
        }
        info!("session driver stopped");
    }

    /// Returns true when the driver should exit.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Request {
                req,
                timeout,
                reply,
            } => {
                let payload = encode_request(&req);
                self.begin(Some(req), payload, Reply::Decoded(reply), timeout)
                    .await;
                false
            }
            Command::Raw {
                payload,
                timeout,
                reply,
            } => {
                self.begin(None, payload, Reply::Raw(reply), timeout).await;
                false
            }
            Command::Cancel => {
                self.fail_pending(ObdError::Cancelled);
                self.reset_link_state();
                false
            }
            Command::Shutdown => {
                self.fail_pending(ObdError::Cancelled);
                true
            }
        }
    }

    async fn begin(
        &mut self,
        request: Option<ObdRequest>,
        payload: Vec<u8>,
        reply: Reply,
        timeout: Duration,
    ) {
        if let Some(err) = &self.error {
            reply.fail(ObdError::Transport(err.clone()));
            return;
        }
        if self.pending.is_some() {
            reply.fail(ObdError::InvalidInput(
                "a request is already in flight".into(),
            ));
            return;
        }

        self.pending = Some(Pending {
            request,
            reply,
            deadline: Instant::now() + timeout,
        });

        // One padded frame, plus the address byte under extended
        // addressing, must fit a single transport write.
        if let LinkMode::Raw { .. } = self.mode {
            let needed = ISOTP_FRAME_LEN + self.config.address_mode.overhead();
            let mtu = self.transport.mtu();
            if mtu < needed {
                self.fail_link(TransportError::MtuTooSmall { mtu, needed });
                return;
            }
        }

        // A response that raced the previous timeout may still satisfy us.
        if let Some(msg) = self.take_unmatched() {
            debug!("request satisfied by a {}-byte late response", msg.len());
            self.resolve_message(msg);
            return;
        }

        enum Plan {
            Tx(TxAction),
            Line(Vec<u8>),
        }
        let plan = match &mut self.mode {
            LinkMode::Raw { transmitter, .. } => transmitter.start(&payload).map(Plan::Tx),
            LinkMode::Elm { lines, collector } => {
                lines.clear();
                collector.reset();
                Ok(Plan::Line(format_request(&payload)))
            }
        };
        match plan {
            Ok(Plan::Tx(action)) => self.apply_tx_action(action).await,
            Ok(Plan::Line(bytes)) => {
                trace!("elm tx {:?}", String::from_utf8_lossy(&bytes));
                if let Err(e) = self.transport.write(&bytes).await {
                    self.fail_link(e);
                }
            }
            Err(e) => self.fail_pending(ObdError::IsoTp(e)),
        }
    }

    async fn handle_inbound(&mut self, chunk: &[u8]) {
        let mut outcomes = Vec::new();
        match &mut self.mode {
            LinkMode::Raw {
                slicer,
                reassembler,
                transmitter,
            } => {
                slicer.push_bytes(chunk);
                loop {
                    let buf = match slicer.next_frame(reassembler.remaining()) {
                        Ok(Some(buf)) => buf,
                        Ok(None) => break,
                        Err(e) => {
                            outcomes.push(Outcome::IsoTp(e));
                            continue;
                        }
                    };
                    let frame = match decode_frame(&buf) {
                        Ok(frame) => frame,
                        Err(e) => {
                            outcomes.push(Outcome::IsoTp(e));
                            continue;
                        }
                    };
                    match frame {
                        // Flow control belongs to our outbound transfer.
                        IsoTpFrame::FlowControl {
                            status,
                            block_size,
                            st_min,
                        } if transmitter.is_active() => {
                            match transmitter.handle_flow_control(status, block_size, st_min) {
                                Ok(action) => outcomes.push(Outcome::Tx(action)),
                                Err(e) => outcomes.push(Outcome::IsoTp(e)),
                            }
                        }
                        frame => match reassembler.handle_frame(frame) {
                            Ok(Some(InboundEvent::Message(msg))) => {
                                outcomes.push(Outcome::Message(msg))
                            }
                            Ok(Some(InboundEvent::SendFlowControl(fc))) => {
                                outcomes.push(Outcome::WriteFc(fc))
                            }
                            Ok(None) => {}
                            Err(e) => outcomes.push(Outcome::IsoTp(e)),
                        },
                    }
                }
            }
            LinkMode::Elm { lines, collector } => {
                lines.push_bytes(chunk);
                while let Some(event) = lines.next_event() {
                    let ElmEvent::Line(text) = event else {
                        continue;
                    };
                    match classify_line(&text) {
                        ElmLine::Frame { ecu, frame } => match collector.push(ecu, &frame) {
                            Ok(Some(msg)) => outcomes.push(Outcome::Message(msg)),
                            Ok(None) => {}
                            Err(e) => outcomes.push(Outcome::IsoTp(e)),
                        },
                        ElmLine::Payload(msg) => outcomes.push(Outcome::Message(msg)),
                        ElmLine::Failure(pe) => outcomes.push(Outcome::Protocol(pe)),
                        ElmLine::Ack => {}
                        ElmLine::Info(text) => trace!("elm info line: {text:?}"),
                    }
                }
            }
        }

        for outcome in outcomes {
            match outcome {
                Outcome::Message(msg) => self.resolve_message(msg),
                Outcome::Tx(action) => self.apply_tx_action(action).await,
                Outcome::WriteFc(fc) => {
                    let bytes = self.frame_bytes(&fc);
                    if let Err(e) = self.transport.write(&bytes).await {
                        self.fail_link(e);
                    }
                }
                Outcome::IsoTp(e) => self.fail_pending(ObdError::IsoTp(e)),
                Outcome::Protocol(pe) => self.fail_pending(ObdError::Protocol(pe)),
            }
        }
    }

    async fn apply_tx_action(&mut self, action: TxAction) {
        match action {
            TxAction::SendAll { frames, gap } => {
                self.fc_deadline = None;
                self.send_frames(&frames, gap).await;
            }
            TxAction::SendThenWait { frames, gap } => {
                self.send_frames(&frames, gap).await;
                self.fc_deadline = Some(Instant::now() + ISOTP_N_BS);
            }
            TxAction::Hold => {
                self.fc_deadline = Some(Instant::now() + ISOTP_N_BS);
            }
        }
    }

    async fn send_frames(&mut self, frames: &[Vec<u8>], gap: Duration) {
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 && !gap.is_zero() {
                sleep(gap).await;
            }
            if let Err(e) = self.transport.write(frame).await {
                self.fail_link(e);
                return;
            }
        }
    }

    fn frame_bytes(&self, frame: &IsoTpFrame) -> Vec<u8> {
        let packed = pack_frame(frame);
        match self.config.address_mode {
            AddressMode::Normal => packed,
            AddressMode::Extended(addr) => {
                let mut out = Vec::with_capacity(1 + packed.len());
                out.push(addr);
                out.extend_from_slice(&packed);
                out
            }
        }
    }

    fn resolve_message(&mut self, msg: Vec<u8>) {
        enum Disposition {
            Stash,
            Extend,
            Resolve,
        }
        let disposition = match &self.pending {
            None => Disposition::Stash,
            Some(pending) => match &pending.request {
                // Raw passthrough: the first whole message wins.
                None => Disposition::Resolve,
                Some(req) => match negative_response(&msg) {
                    Some((service, nrc)) if service == req.service => {
                        if nrc == NRC_RESPONSE_PENDING {
                            Disposition::Extend
                        } else {
                            Disposition::Resolve
                        }
                    }
                    Some(_) => Disposition::Stash,
                    None => {
                        if match_response(req, &msg) {
                            Disposition::Resolve
                        } else {
                            Disposition::Stash
                        }
                    }
                },
            },
        };

        match disposition {
            Disposition::Stash => self.stash_unmatched(msg),
            Disposition::Extend => {
                debug!("peer busy (response pending), extending deadline");
                let deadline = Instant::now() + self.config.request_timeout;
                if let Some(pending) = self.pending.as_mut() {
                    pending.deadline = deadline;
                }
            }
            Disposition::Resolve => {
                if let Some(pending) = self.pending.take() {
                    self.fc_deadline = None;
                    match (pending.reply, pending.request) {
                        (Reply::Raw(tx), _) => {
                            let _ = tx.send(Ok(msg));
                        }
                        (Reply::Decoded(tx), Some(req)) => {
                            let _ = tx.send(decode_response(&req, &msg));
                        }
                        (Reply::Decoded(tx), None) => {
                            let _ = tx.send(Err(ObdError::InvalidInput(
                                "decoded reply requested without a request".into(),
                            )));
                        }
                    }
                }
            }
        }
    }

    fn stash_unmatched(&mut self, msg: Vec<u8>) {
        debug!("unmatched {}-byte message, holding briefly", msg.len());
        self.unmatched
            .retain(|(_, at)| at.elapsed() <= UNMATCHED_MESSAGE_GRACE);
        if self.unmatched.len() >= 8 {
            self.unmatched.pop_front();
        }
        self.unmatched.push_back((msg, std::time::Instant::now()));
    }

    fn take_unmatched(&mut self) -> Option<Vec<u8>> {
        self.unmatched
            .retain(|(_, at)| at.elapsed() <= UNMATCHED_MESSAGE_GRACE);
        let request = match &self.pending {
            Some(pending) => pending.request.as_ref(),
            None => return None,
        };
        let idx = self.unmatched.iter().position(|(msg, _)| match request {
            None => true,
            Some(req) => {
                match_response(req, msg)
                    || matches!(negative_response(msg), Some((s, _)) if s == req.service)
            }
        })?;
        self.unmatched.remove(idx).map(|(msg, _)| msg)
    }

    fn fail_pending(&mut self, err: ObdError) {
        self.fc_deadline = None;
        match self.pending.take() {
            Some(pending) => pending.reply.fail(err),
            None => debug!("link event with no request in flight: {err}"),
        }
    }

    fn fail_link(&mut self, err: TransportError) {
        warn!("transport failure, session unusable: {err}");
        self.error = Some(err.clone());
        self.fail_pending(ObdError::Transport(err));
        self.reset_link_state();
    }

    fn reset_link_state(&mut self) {
        self.fc_deadline = None;
        match &mut self.mode {
            LinkMode::Raw {
                slicer,
                reassembler,
                transmitter,
            } => {
                slicer.clear();
                reassembler.reset();
                transmitter.reset();
            }
            LinkMode::Elm { lines, collector } => {
                lines.clear();
                collector.reset();
            }
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();

        if let Some(deadline) = self.fc_deadline {
            if now >= deadline {
                self.fc_deadline = None;
                if let LinkMode::Raw { transmitter, .. } = &mut self.mode {
                    transmitter.reset();
                }
                self.fail_pending(ObdError::IsoTp(IsoTpError::TimerExpired("N_Bs")));
            }
        }

        let mut cr_expired = false;
        if let LinkMode::Raw {
            reassembler,
            slicer,
            ..
        } = &mut self.mode
        {
            if reassembler.check_timeout(now.into_std()).is_err() {
                slicer.clear();
                cr_expired = true;
            }
        }
        if cr_expired {
            self.fail_pending(ObdError::IsoTp(IsoTpError::TimerExpired("N_Cr")));
        }

        if let Some(pending) = &self.pending {
            if now >= pending.deadline {
                self.fail_pending(ObdError::Timeout);
                self.reset_link_state();
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.pending.as_ref().map(|p| p.deadline);
        if let Some(fc) = self.fc_deadline {
            deadline = Some(deadline.map_or(fc, |d| d.min(fc)));
        }
        if let LinkMode::Raw { reassembler, .. } = &self.mode {
            if let Some(cr) = reassembler.deadline() {
                let cr = Instant::from_std(cr);
                deadline = Some(deadline.map_or(cr, |d| d.min(cr)));
            }
        }
        deadline
    }
}
