#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use atomic_kms::{
    atomic::{AtomicState, ConnectorState, CrtcState, PlaneState, Rejected},
    boost::InputBoost,
    device::{
        Connector, ConnectorFuncs, ConnectorHandle, Crtc, CrtcFuncs, CrtcHandle, DrmDevice,
        DrmDeviceBuilder, Framebuffer, Mode, ModeConfigFuncs, ObjectType, Plane, PlaneFuncs, PlaneHandle,
        PlaneInfo, PlaneType, Property, PropertyId, PropertyKind,
    },
    event::DrmEvent,
    file::{ClientCapability, DrmFile, OutFenceSlots},
    lock::AcquireContext,
    Error,
};
use calloop::{
    channel::{self, Channel},
    EventLoop,
};
use drm_fourcc::{DrmFourcc, DrmModifier};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Object callbacks counting duplicated and destroyed states
#[derive(Debug, Default)]
pub struct ObjectFuncs {
    pub duplicated: AtomicUsize,
    pub destroyed: AtomicUsize,
}

impl ObjectFuncs {
    pub fn live_states(&self) -> usize {
        self.duplicated.load(Ordering::SeqCst) - self.destroyed.load(Ordering::SeqCst)
    }

    fn duplicate(&self) {
        self.duplicated.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

impl CrtcFuncs for ObjectFuncs {
    fn duplicate_state(&self, _crtc: &Crtc, current: &CrtcState) -> Result<CrtcState, Error> {
        self.duplicate();
        Ok(current.duplicate())
    }

    fn destroy_state(&self, _crtc: &Crtc, _state: CrtcState) {
        self.destroy();
    }

    fn set_property(
        &self,
        crtc: &Crtc,
        state: &mut CrtcState,
        property: &Property,
        value: u64,
    ) -> Result<(), Error> {
        if property.name() != "background" {
            return Err(Error::UnknownProperty {
                object: crtc.id(),
                property: property.id(),
            });
        }
        state.set_driver_value(property.id(), value);
        Ok(())
    }

    fn get_property(&self, crtc: &Crtc, state: &CrtcState, property: &Property) -> Result<u64, Error> {
        if property.name() != "background" {
            return Err(Error::UnknownProperty {
                object: crtc.id(),
                property: property.id(),
            });
        }
        Ok(state.driver_value(property.id()).unwrap_or(0))
    }
}

impl PlaneFuncs for ObjectFuncs {
    fn duplicate_state(&self, _plane: &Plane, current: &PlaneState) -> Result<PlaneState, Error> {
        self.duplicate();
        Ok(current.duplicate())
    }

    fn destroy_state(&self, _plane: &Plane, _state: PlaneState) {
        self.destroy();
    }
}

impl ConnectorFuncs for ObjectFuncs {
    fn duplicate_state(&self, _connector: &Connector, current: &ConnectorState) -> Result<ConnectorState, Error> {
        self.duplicate();
        Ok(current.duplicate())
    }

    fn destroy_state(&self, _connector: &Connector, _state: ConnectorState) {
        self.destroy();
    }
}

/// A simulated display controller
#[derive(Debug, Default)]
pub struct SimDriver {
    pub checks: AtomicUsize,
    pub commits: AtomicUsize,
    /// Number of times a transaction got cleared, including its final release
    pub clears: AtomicUsize,
    /// Number of upcoming global checks failing with a deadlock
    pub inject_deadlocks: AtomicUsize,
    /// Fail commits after the check passed
    pub fail_commits: AtomicBool,
    /// Leave commits pending instead of completing them
    pub hold_commits: AtomicBool,
    pub held: Mutex<Vec<AtomicState>>,
    sequence: AtomicU32,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SimDriver {
    /// Waits for all nonblocking commits to finish
    pub fn wait_idle(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            worker.join().unwrap();
        }
    }

    /// Completes every held commit
    pub fn release_held(&self) {
        let held = std::mem::take(&mut *self.held.lock().unwrap());
        for state in held {
            self.complete(state);
        }
    }

    fn complete(&self, mut state: AtomicState) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        for commit in state.take_commits() {
            commit.complete(sequence, Duration::from_millis(16) * sequence);
        }
    }
}

impl ModeConfigFuncs for SimDriver {
    fn atomic_check(&self, _dev: &DrmDevice, _state: &mut AtomicState) -> Result<(), Error> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .inject_deadlocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::Deadlock);
        }
        Ok(())
    }

    fn atomic_commit(&self, _dev: &DrmDevice, mut state: AtomicState, nonblock: bool) -> Result<(), Rejected> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Rejected {
                error: Error::InvalidUsage("simulated hardware failure"),
                state,
            });
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        state.swap_state();

        if self.hold_commits.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push(state);
        } else if nonblock {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let worker = thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                for commit in state.take_commits() {
                    commit.complete(sequence, Duration::from_millis(16) * sequence);
                }
            });
            self.workers.lock().unwrap().push(worker);
        } else {
            self.complete(state);
        }
        Ok(())
    }

    fn atomic_state_clear(&self, state: &mut AtomicState) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        state.default_clear();
    }
}

/// A device with two crtcs, a primary plane per crtc, one overlay usable on both
/// crtcs and two connectors
pub struct Fixture {
    pub dev: Arc<DrmDevice>,
    pub driver: Arc<SimDriver>,
    pub funcs: Arc<ObjectFuncs>,
    pub boost: Arc<InputBoost>,
    pub crtcs: Vec<CrtcHandle>,
    pub primaries: Vec<PlaneHandle>,
    pub overlay: PlaneHandle,
    pub connectors: Vec<ConnectorHandle>,
    pub background: PropertyId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(|_| {})
    }

    /// Like [`Fixture::new`], letting `configure` adjust the device first
    pub fn build(configure: impl FnOnce(&mut DrmDeviceBuilder)) -> Self {
        init_logging();

        let driver = Arc::new(SimDriver::default());
        let funcs = Arc::new(ObjectFuncs::default());
        let boost = Arc::new(InputBoost::new(Duration::from_secs(60)));

        let mut builder = DrmDevice::builder("card0", driver.clone());
        builder.async_page_flip(true).boost_notifier(boost.clone());
        let background = builder
            .driver_property(
                ObjectType::Crtc,
                "background",
                PropertyKind::Range {
                    min: 0,
                    max: u32::MAX as u64,
                },
            )
            .unwrap();

        let crtcs = (0..2)
            .map(|i| builder.add_crtc(format!("crtc-{}", i), funcs.clone()).unwrap())
            .collect::<Vec<_>>();
        let primaries = crtcs
            .iter()
            .enumerate()
            .map(|(i, crtc)| {
                builder
                    .add_plane(PlaneInfo {
                        name: format!("primary-{}", i),
                        plane_type: PlaneType::Primary,
                        possible_crtcs: crtc.mask(),
                        formats: vec![DrmFourcc::Xrgb8888, DrmFourcc::Argb8888],
                        zpos: None,
                        funcs: funcs.clone(),
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        let overlay = builder
            .add_plane(PlaneInfo {
                name: "overlay-0".into(),
                plane_type: PlaneType::Overlay,
                possible_crtcs: crtcs.iter().fold(0, |mask, crtc| mask | crtc.mask()),
                formats: vec![DrmFourcc::Argb8888],
                zpos: Some((1, 8)),
                funcs: funcs.clone(),
            })
            .unwrap();
        let connectors = ["HDMI-A-1", "DP-1"]
            .iter()
            .map(|name| builder.add_connector(*name, funcs.clone()).unwrap())
            .collect::<Vec<_>>();

        configure(&mut builder);
        let dev = builder.build().unwrap();

        Fixture {
            dev,
            driver,
            funcs,
            boost,
            crtcs,
            primaries,
            overlay,
            connectors,
            background,
        }
    }

    /// A transaction with an acquire context set
    pub fn state(&self) -> (Arc<AcquireContext>, AtomicState) {
        let ctx = Arc::new(AcquireContext::new());
        let mut state = AtomicState::alloc(&self.dev).unwrap();
        state.set_acquire_ctx(ctx.clone());
        (ctx, state)
    }

    pub fn fb(&self, width: u32, height: u32) -> Arc<Framebuffer> {
        self.dev
            .add_framebuffer(width, height, DrmFourcc::Xrgb8888, DrmModifier::Linear)
    }

    pub fn mode_blob(&self) -> u64 {
        self.dev.create_blob(&mode_1080p().to_bytes()).unwrap().id().into()
    }

    /// Commits crtc 0 driving connector 0 with its primary plane showing `fb`
    pub fn enable_pipe(&self, fb: &Arc<Framebuffer>) {
        let (ctx, mut state) = self.state();
        let crtc = self.crtcs[0];
        let plane = self.primaries[0];

        let crtc_state = state.get_crtc_state(crtc).unwrap();
        crtc_state.set_mode(&self.dev, Some(&mode_1080p())).unwrap();
        crtc_state.active = true;
        state.set_crtc_for_connector(self.connectors[0], Some(crtc)).unwrap();
        state.set_crtc_for_plane(plane, Some(crtc)).unwrap();
        let plane_state = state.get_plane_state(plane).unwrap();
        plane_state.set_fb(Some(fb.clone()));
        plane_state.crtc_w = fb.width();
        plane_state.crtc_h = fb.height();
        plane_state.src_w = fb.width() << 16;
        plane_state.src_h = fb.height() << 16;

        state.commit().unwrap();
        ctx.drop_locks();
        self.driver.wait_idle();
    }

    /// A client with the atomic capability and registered out-fence slots
    pub fn client(&self) -> Client {
        let slots = Arc::new(OutFenceSlots::new());
        let (file, channel) = DrmFile::new(slots.clone());
        file.set_client_capability(ClientCapability::Atomic, true);
        Client {
            file,
            slots,
            events: EventQueue::new(channel),
        }
    }
}

pub fn mode_1080p() -> Mode {
    Mode::new(148500, (1920, 2008, 2052, 2200), (1080, 1084, 1089, 1125), 60)
}

pub struct Client {
    pub file: Arc<DrmFile>,
    pub slots: Arc<OutFenceSlots>,
    pub events: EventQueue,
}

/// Collects the events sent to a client
pub struct EventQueue {
    event_loop: EventLoop<'static, Vec<DrmEvent>>,
    pending: Vec<DrmEvent>,
}

impl EventQueue {
    pub fn new(source: Channel<DrmEvent>) -> Self {
        let event_loop = EventLoop::try_new().unwrap();
        event_loop
            .handle()
            .insert_source(source, |event, _, events: &mut Vec<DrmEvent>| {
                if let channel::Event::Msg(event) = event {
                    events.push(event);
                }
            })
            .map_err(|err| err.error)
            .unwrap();
        EventQueue {
            event_loop,
            pending: Vec::new(),
        }
    }

    /// Returns every event queued so far
    pub fn dispatch(&mut self) -> Vec<DrmEvent> {
        self.event_loop
            .dispatch(Some(Duration::ZERO), &mut self.pending)
            .unwrap();
        std::mem::take(&mut self.pending)
    }
}
