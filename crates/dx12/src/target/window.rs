use core::{fmt, mem};
use std::sync::{Arc, Weak};

use anyhow::{Context, anyhow};
use ff_common::{Format, PointSize, WindowSize};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    backend::{DeviceBackend, PresentStatus, ResourceStates, SwapChainBackend, SwapChainDesc},
    child::{ChildRegistration, DeviceChild, ResetPriority},
    commands::Commands,
    context::GraphicsContext,
    dispatch::Dispatcher,
    error::{Error, Result},
    fence::FenceValue,
    resource::Resource,
    target::{Target, WindowEvent, WindowHost},
};

const FORMAT: Format = Format::B8G8R8A8Unorm;

type SizeListener = Box<dyn Fn(&WindowSize) + Send + Sync>;
type PresentListener = Box<dyn Fn(usize) + Send + Sync>;

/// Swap chain of a window with one fence value per back buffer.
///
/// Rendering happens on one thread. Window notifications may arrive on another through
/// [`TargetWindow::window_event`] and take effect at the next
/// [`TargetWindow::wait_for_render_ready`].
pub struct TargetWindow {
    shared: Arc<WindowShared>,
}

struct WindowShared {
    context: GraphicsContext,
    host: Arc<dyn WindowHost>,
    dispatcher: Arc<dyn Dispatcher>,
    main_window: bool,
    state: Mutex<WindowState>,
    events: Mutex<Vec<WindowEvent>>,
    size_changed: Mutex<Vec<SizeListener>>,
    render_presented: Mutex<Vec<PresentListener>>,
    _registration: ChildRegistration,
}

#[derive(Default)]
struct WindowState {
    swap_chain: Option<Box<dyn SwapChainBackend>>,
    size: WindowSize,
    back_buffers: Vec<Resource>,
    /// Completes once the frame last rendered into the matching back buffer is done.
    fence_values: Vec<FenceValue>,
    index: usize,
    destroyed: bool,
    was_full_screen_on_close: bool,
    full_screen_on_reset: bool,
}

impl WindowState {
    fn valid(&self) -> bool {
        self.swap_chain.is_some() && !self.destroyed
    }
}

impl TargetWindow {
    #[tracing::instrument(skip_all)]
    pub fn new(
        context: &GraphicsContext,
        host: Arc<dyn WindowHost>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self> {
        let main_window = host.is_main();
        let shared = Arc::new_cyclic(|weak: &Weak<WindowShared>| {
            let child: Weak<dyn DeviceChild> = weak.clone();
            WindowShared {
                context: context.clone(),
                host,
                dispatcher,
                main_window,
                state: Mutex::new(WindowState::default()),
                events: Mutex::new(Vec::new()),
                size_changed: Mutex::new(Vec::new()),
                render_presented: Mutex::new(Vec::new()),
                _registration: context.register_child(child, ResetPriority::TARGET_WINDOW),
            }
        });

        let size = shared.host.size();
        shared.apply_size(&mut shared.state.lock(), size)?;

        info!(?size, main_window, "target window created");
        Ok(Self { shared })
    }

    /// Whether there is a swap chain and a window to present to.
    pub fn is_valid(&self) -> bool {
        self.shared.state.lock().valid()
    }

    pub fn back_buffer_index(&self) -> usize {
        self.shared.state.lock().index
    }

    pub fn back_buffer_count(&self) -> usize {
        self.shared.state.lock().back_buffers.len()
    }

    /// Runs `f` with the back buffer the next frame renders into.
    pub fn with_back_buffer<R>(&self, f: impl FnOnce(&Resource) -> R) -> Option<R> {
        let state = self.shared.state.lock();
        state.back_buffers.get(state.index).map(f)
    }

    /// Applies deferred window events, then blocks until the current back buffer may be
    /// rendered again. `Ok(false)` if there is nothing to render to or the wait timed out.
    pub fn wait_for_render_ready(&self) -> Result<bool> {
        self.apply_events()?;

        let timeout = self.shared.context.config().frame_latency_timeout;
        let fence_value = {
            let state = self.shared.state.lock();
            let Some(swap_chain) = state.swap_chain.as_deref().filter(|_| state.valid()) else {
                return Ok(false);
            };

            if !swap_chain.wait_frame_latency(timeout)? {
                debug!(?timeout, "frame latency wait timed out");
                return Ok(false);
            }

            state.fence_values.get(state.index).cloned().unwrap_or_default()
        };

        fence_value.wait(Some(timeout))
    }

    /// Clears the back buffer, or marks its contents undefined without a color.
    pub fn frame_started(
        &self,
        commands: &mut Commands,
        clear_color: Option<[f32; 4]>,
    ) -> Result<bool> {
        if !self.is_valid() {
            return Ok(false);
        }

        match clear_color {
            Some(color) => self.clear(commands, color)?,
            None => self.discard(commands)?,
        }
        Ok(true)
    }

    /// Executes the frame's commands and presents the back buffer.
    ///
    /// Returns `Err(DeviceLost)` when the device went away; the context must be reset
    /// before the next frame.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn present(&self, mut commands: Commands) -> Result<bool> {
        let index = {
            let mut state = self.shared.state.lock();
            if !state.valid() {
                return Ok(false);
            }

            let index = state.index;
            let back_buffer = state.back_buffers.get(index).ok_or(Error::DeviceLost)?;
            commands.transition(back_buffer, ResourceStates::PRESENT);
            let fence_value = commands.execute()?;
            if let Some(slot) = state.fence_values.get_mut(index) {
                *slot = fence_value;
            }

            let swap_chain = state.swap_chain.as_deref().ok_or(Error::DeviceLost)?;
            match swap_chain.present(self.shared.context.config().sync_interval)? {
                PresentStatus::DeviceLost => {
                    warn!("device lost while presenting");
                    return Err(Error::DeviceLost);
                }
                PresentStatus::Occluded => trace!("window occluded"),
                PresentStatus::Presented => {}
            }

            let next = swap_chain.current_back_buffer_index();
            state.index = next;
            next
        };

        for listener in self.shared.render_presented.lock().iter() {
            listener(index);
        }

        self.shared.context.frame_complete();
        Ok(true)
    }

    /// Resizes the swap chain right away. Must run on the render thread.
    pub fn set_size(&self, size: WindowSize) -> Result<()> {
        let size = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return Ok(());
            }

            self.shared.apply_size(&mut state, size)?;
            state.size
        };

        self.shared.notify_size(&size);
        Ok(())
    }

    pub fn on_size_changed(&self, listener: impl Fn(&WindowSize) + Send + Sync + 'static) {
        self.shared.size_changed.lock().push(Box::new(listener));
    }

    /// Called after every present with the new back buffer index.
    pub fn on_render_presented(&self, listener: impl Fn(usize) + Send + Sync + 'static) {
        self.shared.render_presented.lock().push(Box::new(listener));
    }

    pub fn allow_full_screen(&self) -> bool {
        self.shared.main_window
    }

    /// Current full screen state. After the window closed, the state it had when closing.
    pub fn full_screen(&self) -> bool {
        let state = self.shared.state.lock();
        match state.swap_chain.as_deref() {
            Some(swap_chain) if self.shared.main_window && state.valid() => {
                swap_chain.full_screen().unwrap_or(false)
            }
            _ => state.was_full_screen_on_close,
        }
    }

    /// Returns whether the state changed.
    pub fn set_full_screen(&self, value: bool) -> Result<bool> {
        if !self.shared.main_window {
            return Ok(false);
        }

        {
            let state = self.shared.state.lock();
            let Some(swap_chain) = state.swap_chain.as_deref().filter(|_| state.valid()) else {
                return Ok(false);
            };

            if swap_chain.full_screen()? == value {
                return Ok(false);
            }

            swap_chain
                .set_full_screen(value)
                .context("cannot change full screen state")?;
        }

        debug!(value, "full screen changed");
        self.set_size(self.shared.host.size())?;
        Ok(true)
    }

    /// Queues a window notification. Safe to call from the UI thread.
    pub fn window_event(&self, event: WindowEvent) {
        trace!(?event, "window event deferred");
        self.shared.events.lock().push(event);
    }

    fn apply_events(&self) -> Result<()> {
        let events = mem::take(&mut *self.shared.events.lock());
        for event in events {
            match event {
                WindowEvent::Resized(size) => {
                    // minimized
                    if size.pixel_size.x == 0 || size.pixel_size.y == 0 {
                        continue;
                    }
                    self.set_size(size)?;
                }
                WindowEvent::Deactivated => {
                    self.set_full_screen(false)?;
                }
                WindowEvent::ToggleFullScreen => {
                    let full_screen = self.full_screen();
                    self.set_full_screen(!full_screen)?;
                }
                WindowEvent::Destroyed => {
                    let full_screen = self.full_screen();
                    if full_screen {
                        self.set_full_screen(false)?;
                    }

                    let mut state = self.shared.state.lock();
                    state.was_full_screen_on_close = full_screen;
                    state.destroyed = true;
                    debug!(full_screen, "window destroyed");
                }
            }
        }

        Ok(())
    }
}

impl WindowShared {
    fn create_swap_chain(&self, size: PointSize) -> Result<Box<dyn SwapChainBackend>> {
        let desc = SwapChainDesc {
            width: size.x.max(1) as u32,
            height: size.y.max(1) as u32,
            format: FORMAT,
            buffer_count: self.context.config().back_buffer_count,
        };

        let queue = self.context.direct_queue();
        let host = &self.host;
        let mut created = None;
        // the window's thread owns swap chain creation
        self.dispatcher.send(&mut || {
            created = Some(queue.create_swap_chain(host.raw_window_handle(), &desc));
        });

        let swap_chain = created
            .ok_or_else(|| anyhow!("dispatcher did not run swap chain creation"))?
            .context("cannot create swap chain")?;
        debug!(?desc, "swap chain created");
        Ok(swap_chain)
    }

    fn apply_size(&self, state: &mut WindowState, size: WindowSize) -> Result<()> {
        let old_size = state.size;
        let buffer_size = size.rotated_pixel_size();
        state.size = size;

        if state.swap_chain.is_none() {
            state.swap_chain = Some(self.create_swap_chain(buffer_size)?);
        } else if old_size != size {
            self.before_resize(state)?;

            let swap_chain = state.swap_chain.as_deref().ok_or(Error::DeviceLost)?;
            swap_chain
                .resize_buffers(buffer_size.x.max(1) as u32, buffer_size.y.max(1) as u32)
                .context("cannot resize swap chain buffers")?;
            debug!(?buffer_size, "swap chain resized");
        }

        let swap_chain = state.swap_chain.as_deref().ok_or(Error::DeviceLost)?;
        swap_chain.set_rotation(size.display_rotation())?;
        state.index = swap_chain.current_back_buffer_index();

        if state.back_buffers.is_empty() {
            state.back_buffers = (0..swap_chain.buffer_count())
                .map(|i| {
                    Resource::from_external(
                        &self.context,
                        format!("back buffer {i}"),
                        swap_chain.buffer(i)?,
                        ResourceStates::PRESENT,
                    )
                })
                .collect::<Result<_>>()?;
            state.fence_values = vec![FenceValue::default(); state.back_buffers.len()];
        }

        Ok(())
    }

    /// Releases every reference to the back buffers so the swap chain can resize.
    fn before_resize(&self, state: &mut WindowState) -> Result<()> {
        self.context.wait_for_idle()?;
        state.back_buffers.clear();
        state.fence_values.clear();
        Ok(())
    }

    fn notify_size(&self, size: &WindowSize) {
        for listener in self.size_changed.lock().iter() {
            listener(size);
        }
    }
}

impl DeviceChild for WindowShared {
    fn before_reset(&self) {
        let mut state = self.state.lock();
        state.back_buffers.clear();
        state.fence_values.clear();

        if let Some(swap_chain) = state.swap_chain.take() {
            if self.main_window {
                state.full_screen_on_reset = swap_chain.full_screen().unwrap_or(false);
                if let Err(err) = swap_chain.set_full_screen(false) {
                    debug!(%err, "cannot leave full screen before reset");
                }
            }
        }
    }

    fn reset(&self, _device: &dyn DeviceBackend) -> anyhow::Result<()> {
        let size = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Ok(());
            }

            self.apply_size(&mut state, self.host.size())?;
            if mem::take(&mut state.full_screen_on_reset) {
                if let Some(swap_chain) = state.swap_chain.as_deref() {
                    swap_chain.set_full_screen(true)?;
                }
            }
            state.size
        };

        self.notify_size(&size);
        Ok(())
    }
}

impl Target for TargetWindow {
    fn format(&self) -> Format {
        FORMAT
    }

    fn size(&self) -> WindowSize {
        self.shared.state.lock().size
    }

    fn target_array_start(&self) -> usize {
        0
    }

    fn target_array_size(&self) -> usize {
        1
    }

    fn target_mip_start(&self) -> usize {
        0
    }

    fn target_mip_size(&self) -> usize {
        1
    }

    fn clear(&self, commands: &mut Commands, color: [f32; 4]) -> Result<()> {
        self.with_back_buffer(|back_buffer| commands.clear_resource(back_buffer, color))
            .unwrap_or(Err(Error::DeviceLost))
    }

    fn discard(&self, commands: &mut Commands) -> Result<()> {
        self.with_back_buffer(|back_buffer| commands.discard_resource(back_buffer))
            .unwrap_or(Err(Error::DeviceLost))
    }
}

impl Drop for TargetWindow {
    fn drop(&mut self) {
        if let Err(err) = self.shared.context.wait_for_idle() {
            debug!(%err, "GPU not idle while closing window");
        }

        let mut state = self.shared.state.lock();
        if self.shared.main_window {
            if let Some(swap_chain) = state.swap_chain.as_deref() {
                if let Err(err) = swap_chain.set_full_screen(false) {
                    debug!(%err, "cannot leave full screen while closing window");
                }
            }
        }

        state.back_buffers.clear();
        state.swap_chain = None;
    }
}

impl fmt::Debug for TargetWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TargetWindow")
            .field("size", &state.size)
            .field("index", &state.index)
            .field("back_buffers", &state.back_buffers.len())
            .field("valid", &state.valid())
            .finish_non_exhaustive()
    }
}
