//! Vector XL hardware driver
//!
//! Loads `vxlapi64` (or `vxlapi`) at runtime so the application starts
//! without the vendor library installed. When loading or symbol resolution
//! fails the driver reports itself unavailable and the engine falls back to
//! the simulator.
//!
//! A dedicated receive thread waits on the driver's notification event with
//! a 100 ms bound, dequeues one event, maps it to a [`CanFrame`] and
//! publishes it. The thread works on a copy of the port parameters and never
//! takes the driver's state lock, so `close_channel` can always stop it
//! within one wait interval.

use crate::config::BusConfig;
use crate::dlc::dlc_to_length;
use crate::driver::xl::{self, XLaccess, XLportHandle, XLstatus};
use crate::driver::{is_fatal_hardware_error, CanDriver, ChannelInfo, DriverEvent, EventHub};
use crate::types::{CanFrame, EngineError, Result, MAX_EXTENDED_ID};
use crossbeam_channel::Receiver;
use libloading::Library;
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Library names tried in order
const LIBRARY_CANDIDATES: [&str; 2] = ["vxlapi64", "vxlapi"];

/// Bound of one wait on the notification event
const RX_WAIT: Duration = Duration::from_millis(100);

/// How long `close_channel` waits for the receive thread
const RX_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolved entry points, kept alive together with the library
struct XlApi {
    _lib: Library,
    _kernel32: Option<Library>,
    open_driver: xl::XlOpenDriver,
    close_driver: xl::XlCloseDriver,
    get_driver_config: xl::XlGetDriverConfig,
    open_port: xl::XlOpenPort,
    close_port: xl::XlClosePort,
    activate_channel: xl::XlActivateChannel,
    deactivate_channel: xl::XlDeactivateChannel,
    set_bitrate: xl::XlCanSetChannelBitrate,
    set_output: xl::XlCanSetChannelOutput,
    set_notification: xl::XlSetNotification,
    flush_receive_queue: xl::XlFlushReceiveQueue,
    can_transmit: xl::XlCanTransmit,
    receive: xl::XlReceive,
    fd_set_configuration: Option<xl::XlCanFdSetConfiguration>,
    can_transmit_ex: Option<xl::XlCanTransmitEx>,
    can_receive: Option<xl::XlCanReceive>,
    get_error_string: Option<xl::XlGetErrorString>,
    wait_for_single_object: Option<xl::WaitForSingleObject>,
}

/// Copy a symbol out of a library
///
/// # Safety
/// `T` must be the exact function pointer type of the exported symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Option<T> {
    lib.get::<T>(name.as_bytes()).ok().map(|s| *s)
}

fn open_library() -> std::result::Result<Library, String> {
    let mut last_error = String::new();
    for name in LIBRARY_CANDIDATES {
        // SAFETY: loading runs the library initialisers of the vendor DLL.
        match unsafe { Library::new(libloading::library_filename(name)) } {
            Ok(lib) => {
                log::debug!("Loaded vendor library {}", name);
                return Ok(lib);
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(format!(
        "vxlapi64 not found, is the Vector driver installed? ({})",
        last_error
    ))
}

impl XlApi {
    fn load() -> std::result::Result<Self, String> {
        let lib = open_library()?;

        macro_rules! required {
            ($name:literal) => {
                // SAFETY: type aliases in `xl` match the vxlapi.h prototypes.
                match unsafe { symbol(&lib, $name) } {
                    Some(f) => f,
                    None => {
                        log::warn!("Missing vendor entry point {}", $name);
                        return Err(format!("vendor library lacks {}", $name));
                    }
                }
            };
        }
        macro_rules! optional {
            ($name:literal) => {{
                // SAFETY: type aliases in `xl` match the vxlapi.h prototypes.
                let f = unsafe { symbol(&lib, $name) };
                if f.is_none() {
                    log::debug!("Optional entry point {} not found", $name);
                }
                f
            }};
        }

        let open_driver = required!("xlOpenDriver");
        let close_driver = required!("xlCloseDriver");
        let get_driver_config = required!("xlGetDriverConfig");
        let open_port = required!("xlOpenPort");
        let close_port = required!("xlClosePort");
        let activate_channel = required!("xlActivateChannel");
        let deactivate_channel = required!("xlDeactivateChannel");
        let set_bitrate = required!("xlCanSetChannelBitrate");
        let set_output = required!("xlCanSetChannelOutput");
        let set_notification = required!("xlSetNotification");
        let flush_receive_queue = required!("xlFlushReceiveQueue");
        let can_transmit = required!("xlCanTransmit");
        let receive = required!("xlReceive");

        let fd_set_configuration = optional!("xlCanFdSetConfiguration");
        let can_transmit_ex = optional!("xlCanTransmitEx");
        let can_receive = optional!("xlCanReceive");
        let get_error_string = optional!("xlGetErrorString");

        let (kernel32, wait_for_single_object) = load_wait_function();

        Ok(Self {
            _lib: lib,
            _kernel32: kernel32,
            open_driver,
            close_driver,
            get_driver_config,
            open_port,
            close_port,
            activate_channel,
            deactivate_channel,
            set_bitrate,
            set_output,
            set_notification,
            flush_receive_queue,
            can_transmit,
            receive,
            fd_set_configuration,
            can_transmit_ex,
            can_receive,
            get_error_string,
            wait_for_single_object,
        })
    }

    fn status_to_string(&self, status: XLstatus) -> String {
        if let Some(get_error_string) = self.get_error_string {
            // SAFETY: returns a pointer to a static NUL-terminated string or null.
            let ptr = unsafe { get_error_string(status) };
            if !ptr.is_null() {
                // SAFETY: non-null pointer to a NUL-terminated string owned by the library.
                let text = unsafe { std::ffi::CStr::from_ptr(ptr) };
                return text.to_string_lossy().into_owned();
            }
        }
        xl::status_name(status)
    }
}

#[cfg(windows)]
fn load_wait_function() -> (Option<Library>, Option<xl::WaitForSingleObject>) {
    // SAFETY: kernel32 is always present and has no initialiser side effects.
    let Ok(kernel32) = (unsafe { Library::new("kernel32.dll") }) else {
        return (None, None);
    };
    // SAFETY: WaitForSingleObject(HANDLE, DWORD) -> DWORD matches the alias.
    let wait = unsafe { symbol(&kernel32, "WaitForSingleObject") };
    (Some(kernel32), wait)
}

#[cfg(not(windows))]
fn load_wait_function() -> (Option<Library>, Option<xl::WaitForSingleObject>) {
    (None, None)
}

/// Port parameters the receive path needs, copied out of the locked state
#[derive(Clone, Copy)]
struct PortParams {
    port: XLportHandle,
    is_fd: bool,
    /// Notification handle as an integer so it can cross threads
    notify: usize,
}

struct PortState {
    api: Option<Arc<XlApi>>,
    driver_open: bool,
    port: XLportHandle,
    channel_mask: XLaccess,
    permission_mask: XLaccess,
    is_fd: bool,
    notify: usize,
    /// Channel number stamped on received frames
    channel_number: u8,
}

impl Default for PortState {
    fn default() -> Self {
        Self {
            api: None,
            driver_open: false,
            port: xl::XL_INVALID_PORTHANDLE,
            channel_mask: 0,
            permission_mask: 0,
            is_fd: false,
            notify: 0,
            channel_number: 1,
        }
    }
}

struct RxWorker {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Outcome of one receive attempt
enum RxOutcome {
    Frame(CanFrame),
    /// Timeout, empty queue or a non-data event
    Nothing,
    Failed(String),
}

/// Vector XL driver
pub struct VectorDriver {
    app_name: String,
    hub: Arc<EventHub>,
    state: Mutex<PortState>,
    last_error: Arc<Mutex<String>>,
    rx: Mutex<Option<RxWorker>>,
    available: Mutex<Option<bool>>,
}

impl Default for VectorDriver {
    fn default() -> Self {
        Self::new("AutoLens")
    }
}

impl VectorDriver {
    /// Create a driver registering under `app_name` in the Vector config
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            hub: Arc::new(EventHub::new()),
            state: Mutex::new(PortState::default()),
            last_error: Arc::new(Mutex::new(String::new())),
            rx: Mutex::new(None),
            available: Mutex::new(None),
        }
    }

    fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[VectorCAN] {}", message);
        *self.last_error.lock() = message;
    }

    /// Record, publish and return a failed XL call
    fn xl_error(&self, api: &XlApi, context: &str, status: XLstatus) -> String {
        let message = format!("{}: {}", context, api.status_to_string(status));
        self.set_error(message.clone());
        self.hub.publish(DriverEvent::Error(message.clone()));
        message
    }

    /// DLL version as "major.minor.build"
    pub fn dll_version(&self) -> Option<String> {
        let state = self.state.lock();
        let api = state.api.as_ref()?;
        if !state.driver_open {
            return None;
        }
        let mut cfg = xl::XLdriverConfig::zeroed();
        // SAFETY: cfg is a valid, writable XLdriverConfig.
        let status = unsafe { (api.get_driver_config)(&mut *cfg) };
        if status != xl::XL_SUCCESS {
            return None;
        }
        let v = cfg.dllVersion;
        Some(format!("{}.{}.{}", (v >> 24) & 0xFF, (v >> 16) & 0xFF, v & 0xFFFF))
    }

    fn start_receive_thread(&self, params: PortParams, channel: u8, api: Arc<XlApi>) {
        let cancel = Arc::new(AtomicBool::new(false));
        let hub = Arc::clone(&self.hub);
        let last_error = Arc::clone(&self.last_error);
        let worker_cancel = Arc::clone(&cancel);

        let spawned = std::thread::Builder::new()
            .name("autolens-can-rx".to_string())
            .spawn(move || {
                raise_receive_priority();
                let mut fatal_reported = false;
                while !worker_cancel.load(Ordering::Acquire) {
                    match receive_once(&api, params, channel, RX_WAIT) {
                        RxOutcome::Frame(frame) => hub.publish(DriverEvent::FrameReceived(frame)),
                        RxOutcome::Nothing => {}
                        RxOutcome::Failed(message) => {
                            *last_error.lock() = message.clone();
                            if is_fatal_hardware_error(&message) {
                                if !fatal_reported {
                                    log::error!("[VectorCAN] {}", message);
                                    hub.publish(DriverEvent::Error(message));
                                    fatal_reported = true;
                                }
                                std::thread::sleep(RX_WAIT);
                            } else {
                                log::warn!("[VectorCAN] {}", message);
                                hub.publish(DriverEvent::Error(message));
                            }
                        }
                    }
                }
                log::debug!("CAN receive thread stopped");
            });

        match spawned {
            Ok(handle) => *self.rx.lock() = Some(RxWorker { cancel, handle }),
            Err(e) => self.set_error(format!("Failed to start receive thread: {}", e)),
        }
    }

    fn stop_receive_thread(&self) {
        let Some(worker) = self.rx.lock().take() else {
            return;
        };
        worker.cancel.store(true, Ordering::Release);

        let deadline = Instant::now() + RX_STOP_TIMEOUT;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if worker.handle.is_finished() {
            let _ = worker.handle.join();
        } else {
            log::warn!("[VectorCAN] Receive thread did not stop in time, detaching");
        }
    }

    fn transmit_classic(&self, api: &XlApi, state: &PortState, frame: &CanFrame) -> Result<()> {
        let mut event = xl::XLevent {
            tag: xl::XL_TRANSMIT_MSG,
            ..Default::default()
        };
        let dlc = frame.dlc.min(8);
        event.msg.id = frame.id;
        if frame.is_extended {
            event.msg.id |= xl::XL_CAN_EXT_MSG_ID;
        }
        if frame.is_remote_frame {
            event.msg.flags |= xl::XL_CAN_MSG_FLAG_REMOTE_FRAME;
        }
        event.msg.dlc = dlc as u16;
        event.msg.data[..dlc as usize].copy_from_slice(&frame.data[..dlc as usize]);

        let mut count: u32 = 1;
        // SAFETY: event is a valid XLevent; count matches the number of events.
        let status = unsafe {
            (api.can_transmit)(
                state.port,
                state.channel_mask,
                &mut count,
                &mut event as *mut xl::XLevent as *mut c_void,
            )
        };
        if status != xl::XL_SUCCESS {
            return Err(EngineError::TransmitFailed(self.xl_error(api, "xlCanTransmit", status)));
        }
        Ok(())
    }

    fn transmit_fd(&self, api: &XlApi, state: &PortState, frame: &CanFrame) -> Result<()> {
        let Some(transmit_ex) = api.can_transmit_ex else {
            return Err(EngineError::TransmitFailed("FD transmit not available".to_string()));
        };
        let mut tx = xl::XLcanTxEvent {
            tag: xl::XL_CAN_EV_TAG_TX_MSG,
            ..Default::default()
        };
        tx.msg.canId = frame.id | if frame.is_extended { xl::XL_CAN_EXT_MSG_ID } else { 0 };
        tx.msg.msgFlags = xl::XL_CAN_TXMSG_FLAG_EDL;
        if frame.brs {
            tx.msg.msgFlags |= xl::XL_CAN_TXMSG_FLAG_BRS;
        }
        if frame.is_remote_frame {
            tx.msg.msgFlags |= xl::XL_CAN_TXMSG_FLAG_RTR;
        }
        tx.msg.dlc = frame.dlc;
        let len = dlc_to_length(frame.dlc);
        tx.msg.data[..len].copy_from_slice(&frame.data[..len]);

        let mut sent: u32 = 0;
        // SAFETY: tx is a valid XLcanTxEvent and we pass a count of one.
        let status = unsafe { transmit_ex(state.port, state.channel_mask, 1, &mut sent, &mut tx) };
        if status != xl::XL_SUCCESS {
            return Err(EngineError::TransmitFailed(self.xl_error(api, "xlCanTransmitEx", status)));
        }
        if sent == 0 {
            return Err(EngineError::TransmitFailed("TX queue full".to_string()));
        }
        Ok(())
    }
}

/// Move the calling thread to maximum scheduling priority; returns false
/// when the OS refuses (e.g. Linux without CAP_SYS_NICE)
fn raise_receive_priority() -> bool {
    match thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max) {
        Ok(()) => {
            log::debug!("CAN receive thread started at maximum priority");
            true
        }
        Err(e) => {
            log::warn!(
                "[VectorCAN] Failed to raise receive thread priority: {:?}; continuing at default priority",
                e
            );
            false
        }
    }
}

/// Wait for data and dequeue one event
fn receive_once(api: &XlApi, params: PortParams, channel: u8, timeout: Duration) -> RxOutcome {
    if params.notify != 0 {
        if let Some(wait) = api.wait_for_single_object {
            // SAFETY: notify is the event handle returned by xlSetNotification.
            let result = unsafe { wait(params.notify as xl::XLhandle, timeout.as_millis() as u32) };
            if result == xl::WAIT_TIMEOUT {
                return RxOutcome::Nothing;
            }
            if result != xl::WAIT_OBJECT_0 {
                return RxOutcome::Failed("Wait error".to_string());
            }
        }
    }

    let outcome = match (params.is_fd, api.can_receive) {
        (true, Some(can_receive)) => receive_fd(api, can_receive, params.port, channel),
        _ => receive_classic(api, params.port, channel),
    };

    // Without a waitable event, poll gently instead of spinning
    if matches!(outcome, RxOutcome::Nothing) && api.wait_for_single_object.is_none() {
        std::thread::sleep(Duration::from_millis(1));
    }
    outcome
}

fn receive_classic(api: &XlApi, port: XLportHandle, channel: u8) -> RxOutcome {
    let mut event = xl::XLevent::default();
    let mut count: u32 = 1;
    // SAFETY: event is writable storage for one XLevent.
    let status = unsafe { (api.receive)(port, &mut count, &mut event) };
    if status == xl::XL_ERR_QUEUE_IS_EMPTY {
        return RxOutcome::Nothing;
    }
    if status != xl::XL_SUCCESS {
        return RxOutcome::Failed(format!("xlReceive: {}", api.status_to_string(status)));
    }
    if event.tag != xl::XL_RECEIVE_MSG {
        return RxOutcome::Nothing;
    }

    let msg = event.msg;
    let dlc = msg.dlc.min(8) as u8;
    let mut frame = CanFrame {
        id: msg.id & MAX_EXTENDED_ID,
        is_extended: msg.id & xl::XL_CAN_EXT_MSG_ID != 0,
        dlc,
        is_remote_frame: msg.flags & xl::XL_CAN_MSG_FLAG_REMOTE_FRAME != 0,
        is_error_frame: msg.flags & xl::XL_CAN_MSG_FLAG_ERROR_FRAME != 0,
        is_tx_echo: msg.flags & xl::XL_CAN_MSG_FLAG_TX_COMPLETED != 0,
        channel,
        timestamp_ns: event.timeStamp,
        ..CanFrame::default()
    };
    if !frame.is_remote_frame && !frame.is_error_frame {
        frame.data[..dlc as usize].copy_from_slice(&msg.data[..dlc as usize]);
    }
    RxOutcome::Frame(frame)
}

fn receive_fd(
    api: &XlApi,
    can_receive: xl::XlCanReceive,
    port: XLportHandle,
    channel: u8,
) -> RxOutcome {
    let mut rx = xl::XLcanRxEvent::default();
    // SAFETY: rx is writable storage for one XLcanRxEvent.
    let status = unsafe { can_receive(port, &mut rx) };
    if status == xl::XL_ERR_QUEUE_IS_EMPTY {
        return RxOutcome::Nothing;
    }
    if status != xl::XL_SUCCESS {
        return RxOutcome::Failed(format!("xlCanReceive: {}", api.status_to_string(status)));
    }
    if rx.tag != xl::XL_CAN_EV_TAG_RX_OK && rx.tag != xl::XL_CAN_EV_TAG_TX_OK {
        return RxOutcome::Nothing;
    }

    let msg = rx.msg;
    let flags = msg.msgFlags;
    let mut frame = CanFrame {
        id: msg.canId & MAX_EXTENDED_ID,
        is_extended: msg.canId & xl::XL_CAN_EXT_MSG_ID != 0,
        dlc: msg.dlc.min(15),
        is_fd: flags & xl::XL_CAN_RXMSG_FLAG_EDL != 0,
        brs: flags & xl::XL_CAN_RXMSG_FLAG_BRS != 0,
        esi: flags & xl::XL_CAN_RXMSG_FLAG_ESI != 0,
        is_remote_frame: flags & xl::XL_CAN_RXMSG_FLAG_RTR != 0,
        is_error_frame: flags & xl::XL_CAN_RXMSG_FLAG_EF != 0,
        is_tx_echo: rx.tag == xl::XL_CAN_EV_TAG_TX_OK,
        channel,
        timestamp_ns: rx.timeStampSync,
        ..CanFrame::default()
    };
    if !frame.is_fd {
        frame.dlc = frame.dlc.min(8);
    }
    let len = frame.data_len();
    frame.data[..len].copy_from_slice(&msg.data[..len]);
    RxOutcome::Frame(frame)
}

impl CanDriver for VectorDriver {
    fn driver_name(&self) -> String {
        "Vector XL".to_string()
    }

    fn is_available(&self) -> bool {
        let mut cached = self.available.lock();
        if let Some(available) = *cached {
            return available;
        }
        let available = open_library().is_ok();
        *cached = Some(available);
        available
    }

    fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.driver_open {
            return Ok(());
        }

        let api = match XlApi::load() {
            Ok(api) => Arc::new(api),
            Err(message) => {
                drop(state);
                self.set_error(message.clone());
                return Err(EngineError::DriverUnavailable(message));
            }
        };

        // SAFETY: no preconditions.
        let status = unsafe { (api.open_driver)() };
        if status != xl::XL_SUCCESS {
            let message = format!("xlOpenDriver failed: {}", api.status_to_string(status));
            drop(state);
            self.set_error(message.clone());
            return Err(EngineError::DriverUnavailable(message));
        }

        state.api = Some(api);
        state.driver_open = true;
        drop(state);
        log::info!(
            "[VectorCAN] Initialized. DLL version: {}",
            self.dll_version().unwrap_or_else(|| "unknown".to_string())
        );
        Ok(())
    }

    fn shutdown(&self) {
        self.close_channel();
        let mut state = self.state.lock();
        if state.driver_open {
            if let Some(api) = &state.api {
                // SAFETY: the driver was opened by xlOpenDriver.
                unsafe { (api.close_driver)() };
            }
            state.driver_open = false;
        }
        state.api = None;
        log::debug!("[VectorCAN] Shut down");
    }

    fn detect_channels(&self) -> Vec<ChannelInfo> {
        let api = {
            let state = self.state.lock();
            state.api.clone().filter(|_| state.driver_open)
        };
        let Some(api) = api else {
            self.set_error("Driver not initialized");
            return Vec::new();
        };

        let mut cfg = xl::XLdriverConfig::zeroed();
        // SAFETY: cfg is a valid, writable XLdriverConfig.
        let status = unsafe { (api.get_driver_config)(&mut *cfg) };
        if status != xl::XL_SUCCESS {
            self.set_error(format!("xlGetDriverConfig: {}", api.status_to_string(status)));
            return Vec::new();
        }

        let count = (cfg.channelCount as usize).min(xl::XL_CONFIG_MAX_CHANNELS);
        log::debug!("[VectorCAN] {} total channels", count);

        let channels = cfg.channel;
        let mut result = Vec::new();
        for ch in channels.iter().take(count) {
            let bus_caps = ch.channelBusCapabilities;
            if bus_caps & xl::XL_BUS_COMPATIBLE_CAN == 0 {
                continue;
            }
            let caps = ch.channelCapabilities;
            let name = ch.name;
            let transceiver = ch.transceiverName;
            let info = ChannelInfo {
                name: xl::c_chars_to_string(&name),
                hw_type_name: xl::hw_type_name(ch.hwType),
                hw_type: ch.hwType,
                hw_index: ch.hwIndex,
                hw_channel: ch.hwChannel,
                channel_index: ch.channelIndex,
                channel_mask: ch.channelMask,
                serial: ch.serialNumber,
                supports_fd: caps
                    & (xl::XL_CHANNEL_FLAG_CANFD_ISO_SUPPORT
                        | xl::XL_CHANNEL_FLAG_CANFD_BOSCH_SUPPORT)
                    != 0,
                is_on_bus: ch.isOnBus != 0,
                transceiver_name: xl::c_chars_to_string(&transceiver),
            };
            log::debug!(
                "[VectorCAN]  {} S/N: {} FD: {}",
                info.name,
                info.serial,
                info.supports_fd
            );
            result.push(info);
        }
        result
    }

    fn open_channel(&self, info: &ChannelInfo, config: &BusConfig) -> Result<()> {
        let mut state = self.state.lock();
        let Some(api) = state.api.clone().filter(|_| state.driver_open) else {
            return Err(EngineError::ChannelOpenFailed("Driver not initialized".to_string()));
        };
        if state.port != xl::XL_INVALID_PORTHANDLE {
            return Err(EngineError::ChannelOpenFailed(
                "Channel already open, close first".to_string(),
            ));
        }

        let mut is_fd = config.fd_enabled && info.supports_fd;
        let channel_mask = info.channel_mask;
        let mut permission_mask = channel_mask;
        let mut port: XLportHandle = xl::XL_INVALID_PORTHANDLE;
        let interface_version = if is_fd {
            xl::XL_INTERFACE_VERSION_V4
        } else {
            xl::XL_INTERFACE_VERSION
        };

        let app_name = CString::new(self.app_name.clone()).unwrap_or_default();
        let mut app_name_bytes = app_name.into_bytes_with_nul();
        // SAFETY: all pointers reference live, writable locals.
        let status = unsafe {
            (api.open_port)(
                &mut port,
                app_name_bytes.as_mut_ptr() as *mut std::os::raw::c_char,
                channel_mask,
                &mut permission_mask,
                xl::RX_QUEUE_SIZE,
                interface_version,
                xl::XL_BUS_TYPE_CAN,
            )
        };
        if status != xl::XL_SUCCESS {
            drop(state);
            let message = self.xl_error(&api, "xlOpenPort", status);
            return Err(EngineError::ChannelOpenFailed(message));
        }

        if permission_mask & channel_mask != 0 {
            if is_fd {
                let configured = api.fd_set_configuration.map(|set_fd| {
                    let mut fd = xl::XLcanFdConf {
                        arbitrationBitRate: config.bitrate,
                        sjwAbr: 2,
                        tseg1Abr: 6,
                        tseg2Abr: 3,
                        dataBitRate: config.data_bitrate,
                        sjwDbr: 2,
                        tseg1Dbr: 6,
                        tseg2Dbr: 3,
                        ..Default::default()
                    };
                    // SAFETY: fd is a valid XLcanFdConf for the open port.
                    unsafe { set_fd(port, channel_mask, &mut fd) }
                });
                if configured != Some(xl::XL_SUCCESS) {
                    log::warn!("[VectorCAN] FD configuration refused, falling back to classic CAN");
                    is_fd = false;
                }
            }
            if !is_fd {
                // SAFETY: port is open.
                unsafe { (api.set_bitrate)(port, channel_mask, config.bitrate) };
            }
            let mode = if config.listen_only {
                xl::XL_OUTPUT_MODE_SILENT
            } else {
                xl::XL_OUTPUT_MODE_NORMAL
            };
            // SAFETY: port is open.
            unsafe { (api.set_output)(port, channel_mask, mode) };
        } else {
            log::warn!("[VectorCAN] No init access, listen-only (another application owns it)");
        }

        let mut notify: xl::XLhandle = std::ptr::null_mut();
        // SAFETY: notify is writable storage for the returned handle.
        unsafe { (api.set_notification)(port, &mut notify, 1) };

        // SAFETY: port is open and configured.
        let status = unsafe {
            (api.activate_channel)(
                port,
                channel_mask,
                xl::XL_BUS_TYPE_CAN,
                xl::XL_ACTIVATE_RESET_CLOCK,
            )
        };
        if status != xl::XL_SUCCESS {
            // SAFETY: port is open.
            unsafe { (api.close_port)(port) };
            drop(state);
            let message = self.xl_error(&api, "xlActivateChannel", status);
            return Err(EngineError::ChannelOpenFailed(message));
        }
        // SAFETY: port is active.
        unsafe { (api.flush_receive_queue)(port) };

        state.port = port;
        state.channel_mask = channel_mask;
        state.permission_mask = permission_mask;
        state.is_fd = is_fd;
        state.notify = notify as usize;
        state.channel_number = info.hw_channel.saturating_add(1);

        let params = PortParams {
            port,
            is_fd,
            notify: state.notify,
        };
        let channel = state.channel_number;
        drop(state);

        log::info!(
            "[VectorCAN] Channel open: {} FD: {} Bitrate: {}",
            info.name,
            is_fd,
            config.bitrate
        );
        self.start_receive_thread(params, channel, api);
        self.hub.publish(DriverEvent::ChannelOpened);
        Ok(())
    }

    fn close_channel(&self) {
        self.stop_receive_thread();

        let mut state = self.state.lock();
        if state.port == xl::XL_INVALID_PORTHANDLE {
            return;
        }
        if let Some(api) = &state.api {
            // SAFETY: port is open.
            unsafe {
                (api.deactivate_channel)(state.port, state.channel_mask);
                (api.close_port)(state.port);
            }
        }
        state.port = xl::XL_INVALID_PORTHANDLE;
        state.channel_mask = 0;
        state.permission_mask = 0;
        state.notify = 0;
        state.is_fd = false;
        drop(state);

        log::info!("[VectorCAN] Channel closed");
        self.hub.publish(DriverEvent::ChannelClosed);
    }

    fn is_open(&self) -> bool {
        self.state.lock().port != xl::XL_INVALID_PORTHANDLE
    }

    fn transmit(&self, frame: &CanFrame) -> Result<()> {
        let state = self.state.lock();
        let Some(api) = state.api.clone() else {
            return Err(EngineError::TransmitFailed("Channel not open".to_string()));
        };
        if state.port == xl::XL_INVALID_PORTHANDLE {
            return Err(EngineError::TransmitFailed("Channel not open".to_string()));
        }
        if state.permission_mask & state.channel_mask == 0 {
            return Err(EngineError::TransmitFailed("No TX access (listen-only)".to_string()));
        }
        if frame.is_fd && state.is_fd {
            self.transmit_fd(&api, &state, frame)
        } else {
            self.transmit_classic(&api, &state, frame)
        }
    }

    fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>> {
        let (api, params, channel) = {
            let state = self.state.lock();
            match (&state.api, state.port) {
                (Some(api), port) if port != xl::XL_INVALID_PORTHANDLE => (
                    Arc::clone(api),
                    PortParams {
                        port,
                        is_fd: state.is_fd,
                        notify: state.notify,
                    },
                    state.channel_number,
                ),
                _ => return Err(EngineError::NotConnected),
            }
        };
        match receive_once(&api, params, channel, timeout) {
            RxOutcome::Frame(frame) => Ok(Some(frame)),
            RxOutcome::Nothing => Ok(None),
            RxOutcome::Failed(message) if is_fatal_hardware_error(&message) => {
                self.set_error(message.clone());
                Err(EngineError::HardwareRemoved(message))
            }
            RxOutcome::Failed(message) => {
                self.set_error(message.clone());
                Err(EngineError::DriverUnavailable(message))
            }
        }
    }

    fn flush_receive_queue(&self) -> Result<()> {
        let state = self.state.lock();
        let Some(api) = state.api.clone() else {
            return Err(EngineError::NotConnected);
        };
        if state.port == xl::XL_INVALID_PORTHANDLE {
            return Err(EngineError::NotConnected);
        }
        // SAFETY: port is open.
        let status = unsafe { (api.flush_receive_queue)(state.port) };
        drop(state);
        if status != xl::XL_SUCCESS {
            let message = self.xl_error(&api, "xlFlushReceiveQueue", status);
            return Err(EngineError::DriverUnavailable(message));
        }
        Ok(())
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn subscribe(&self) -> Receiver<DriverEvent> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_driver_rejects_io() {
        let driver = VectorDriver::new("AutoLensTest");
        assert!(!driver.is_open());
        assert!(driver.detect_channels().is_empty());
        assert_eq!(driver.last_error(), "Driver not initialized");

        let err = driver.transmit(&CanFrame::classic(0x100, &[1])).unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::TransmitFailed);
        assert!(driver.receive(Duration::from_millis(1)).is_err());
        assert!(driver.flush_receive_queue().is_err());
    }

    #[test]
    fn test_close_without_open_is_noop() {
        let driver = VectorDriver::default();
        let events = driver.subscribe();
        driver.close_channel();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_receive_priority_is_best_effort() {
        // Unprivileged runs are refused by the OS; the worker must carry on either way
        let worker = std::thread::Builder::new()
            .name("autolens-can-rx".to_string())
            .spawn(|| {
                let raised = raise_receive_priority();
                (raised, std::thread::current().name().map(str::to_string))
            })
            .unwrap();
        let (_raised, name) = worker.join().unwrap();
        assert_eq!(name.as_deref(), Some("autolens-can-rx"));
    }
}
