//! DXGI Desktop Duplication capture for Windows.
//!
//! Each bind creates a D3D11 device on the adapter that owns the chosen
//! output, duplicates that output and allocates a CPU-readable staging
//! texture of the same size. Acquired frames stay on the GPU until
//! [`copy_to_host`](CaptureBackend::copy_to_host) maps the staging copy.
//!
//! Window enumeration lives here too since it uses the same platform
//! crate. On other platforms the type exists but every bind fails.

use std::time::Duration;

use super::{AcquiredFrame, CaptureBackend, MonitorInfo, Rect, WindowHandle, WindowInfo};
use crate::error::CaptureError;
use crate::frame::RawFrame;

/// Desktop Duplication backend. Outputs are indexed across all adapters
/// in enumeration order.
pub struct DxgiBackend {
    #[cfg(target_os = "windows")]
    session: Option<platform::Session>,
    #[cfg(target_os = "windows")]
    held: bool,
}

// ── Windows implementation ───────────────────────────────────────

#[cfg(target_os = "windows")]
mod platform {
    use std::ffi::c_void;
    use std::mem::size_of;

    use tracing::debug;
    use windows::{
        Win32::Foundation::{BOOL, E_ACCESSDENIED, HWND, LPARAM, RECT, TRUE},
        Win32::Graphics::{
            Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_UNKNOWN},
            Direct3D11::*,
            Dwm::{DWMWA_CLOAKED, DwmGetWindowAttribute},
            Dxgi::{Common::*, *},
            Gdi::{HMONITOR, MONITOR_DEFAULTTONULL, MonitorFromWindow},
        },
        Win32::UI::WindowsAndMessaging::{
            EnumWindows, GWL_EXSTYLE, GetClassNameW, GetWindowLongW, GetWindowRect,
            GetWindowTextW, IsIconic, IsWindow, IsWindowVisible, WS_EX_APPWINDOW,
            WS_EX_TOOLWINDOW,
        },
        core::Interface,
    };

    use super::*;
    use crate::capture::region::{WindowCandidate, is_capturable};
    use crate::frame::{CursorInfo, PixelFormat};

    /// One duplicated output.
    pub(super) struct Session {
        context: ID3D11DeviceContext,
        duplication: IDXGIOutputDuplication,
        staging: ID3D11Texture2D,
        width: u32,
        height: u32,
        /// Texture of the frame currently held.
        frame: Option<ID3D11Texture2D>,
        cursor: CursorInfo,
        // Device kept last so it outlives the objects above.
        _device: ID3D11Device,
    }

    struct OutputEntry {
        adapter: IDXGIAdapter1,
        output: IDXGIOutput,
        desc: DXGI_OUTPUT_DESC,
    }

    fn platform_err(what: &str, e: windows::core::Error) -> CaptureError {
        CaptureError::Platform(format!("{what} failed: {e}"))
    }

    fn rect_from(r: RECT) -> Rect {
        Rect::new(r.left, r.top, r.right, r.bottom)
    }

    fn wide_to_string(buf: &[u16]) -> String {
        let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        String::from_utf16_lossy(&buf[..end])
    }

    fn hwnd(handle: WindowHandle) -> HWND {
        HWND(handle.0 as usize as *mut c_void)
    }

    /// Every attached output of every adapter, in enumeration order.
    fn enumerate_outputs() -> Result<Vec<OutputEntry>, CaptureError> {
        let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
            .map_err(|e| CaptureError::Unavailable(format!("CreateDXGIFactory1: {e}")))?;

        let mut entries = Vec::new();
        let mut a = 0;
        while let Ok(adapter) = unsafe { factory.EnumAdapters1(a) } {
            let mut o = 0;
            while let Ok(output) = unsafe { adapter.EnumOutputs(o) } {
                if let Ok(desc) = unsafe { output.GetDesc() } {
                    if desc.AttachedToDesktop.as_bool() {
                        entries.push(OutputEntry {
                            adapter: adapter.clone(),
                            output,
                            desc,
                        });
                    }
                }
                o += 1;
            }
            a += 1;
        }
        Ok(entries)
    }

    fn monitor_info(index: usize, desc: &DXGI_OUTPUT_DESC) -> MonitorInfo {
        let rect = rect_from(desc.DesktopCoordinates);
        MonitorInfo {
            index: index as u32,
            name: wide_to_string(&desc.DeviceName),
            rect,
            primary: rect.left == 0 && rect.top == 0,
        }
    }

    fn create_device(
        adapter: &IDXGIAdapter1,
    ) -> Result<(ID3D11Device, ID3D11DeviceContext), CaptureError> {
        let mut device = None;
        let mut context = None;

        // An explicit adapter requires the UNKNOWN driver type.
        let base: IDXGIAdapter = adapter.cast().map_err(|e| platform_err("IDXGIAdapter cast", e))?;
        let on_adapter = unsafe {
            D3D11CreateDevice(
                &base,
                D3D_DRIVER_TYPE_UNKNOWN,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        };
        if let Err(e) = on_adapter {
            debug!(error = %e, "device on output adapter failed; trying default hardware");
            unsafe {
                D3D11CreateDevice(
                    None,
                    D3D_DRIVER_TYPE_HARDWARE,
                    None,
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    None,
                    D3D11_SDK_VERSION,
                    Some(&mut device),
                    None,
                    Some(&mut context),
                )
            }
            .map_err(|e| CaptureError::Unavailable(format!("D3D11CreateDevice: {e}")))?;
        }

        match (device, context) {
            (Some(d), Some(c)) => Ok((d, c)),
            _ => Err(CaptureError::Unavailable("D3D11 returned no device".into())),
        }
    }

    fn duplicate_err(e: windows::core::Error) -> CaptureError {
        let code = e.code();
        if code == E_ACCESSDENIED || code == DXGI_ERROR_NOT_CURRENTLY_AVAILABLE {
            CaptureError::AccessDenied(e.message())
        } else if code == DXGI_ERROR_UNSUPPORTED {
            CaptureError::Unavailable(e.message())
        } else {
            platform_err("DuplicateOutput", e)
        }
    }

    impl Session {
        fn open(entry: &OutputEntry) -> Result<Self, CaptureError> {
            let (device, context) = create_device(&entry.adapter)?;
            let output1: IDXGIOutput1 = entry
                .output
                .cast()
                .map_err(|e| platform_err("IDXGIOutput1 cast", e))?;
            let duplication = unsafe { output1.DuplicateOutput(&device) }.map_err(duplicate_err)?;

            let dup_desc = unsafe { duplication.GetDesc() };
            let width = dup_desc.ModeDesc.Width;
            let height = dup_desc.ModeDesc.Height;

            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };
            let mut staging = None;
            unsafe { device.CreateTexture2D(&staging_desc, None, Some(&mut staging)) }
                .map_err(|e| platform_err("CreateTexture2D", e))?;
            let staging =
                staging.ok_or_else(|| CaptureError::Platform("no staging texture".into()))?;

            Ok(Self {
                context,
                duplication,
                staging,
                width,
                height,
                frame: None,
                cursor: CursorInfo::default(),
                _device: device,
            })
        }

        fn acquire(&mut self, timeout: Duration) -> Result<Option<AcquiredFrame>, CaptureError> {
            let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource = None;
            let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;

            match unsafe {
                self.duplication
                    .AcquireNextFrame(timeout_ms, &mut info, &mut resource)
            } {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
                Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => {
                    return Err(CaptureError::AccessLost);
                }
                Err(e) => return Err(platform_err("AcquireNextFrame", e)),
            }

            let texture = resource
                .ok_or_else(|| CaptureError::Platform("no desktop resource".into()))
                .and_then(|r| {
                    r.cast::<ID3D11Texture2D>()
                        .map_err(|e| platform_err("ID3D11Texture2D cast", e))
                });
            let texture = match texture {
                Ok(t) => t,
                Err(e) => {
                    let _ = unsafe { self.duplication.ReleaseFrame() };
                    return Err(e);
                }
            };

            // Pointer data is only present when the mouse changed.
            if info.LastMouseUpdateTime != 0 {
                let p = info.PointerPosition;
                self.cursor = CursorInfo {
                    visible: p.Visible.as_bool(),
                    x: p.Position.x,
                    y: p.Position.y,
                };
            }
            self.frame = Some(texture);
            Ok(Some(AcquiredFrame {
                cursor: self.cursor,
            }))
        }

        fn copy_to_host(&mut self, dst: &mut RawFrame) -> Result<(), CaptureError> {
            let texture = self.frame.as_ref().ok_or(CaptureError::NoFrameHeld)?;
            unsafe { self.context.CopyResource(&self.staging, texture) };

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe {
                self.context
                    .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
            }
            .map_err(|e| platform_err("Map", e))?;

            let pitch = mapped.RowPitch;
            dst.prepare(self.width, self.height, pitch, PixelFormat::Bgra8);
            // SAFETY: the mapped staging texture is `RowPitch * height`
            // bytes and stays mapped until Unmap below.
            let src = unsafe {
                std::slice::from_raw_parts(mapped.pData as *const u8, dst.byte_len())
            };
            dst.data.copy_from_slice(src);

            unsafe { self.context.Unmap(&self.staging, 0) };
            Ok(())
        }

        fn release(&mut self) {
            if self.frame.take().is_some() {
                let _ = unsafe { self.duplication.ReleaseFrame() };
            }
        }
    }

    impl Drop for Session {
        fn drop(&mut self) {
            self.release();
        }
    }

    // ── Windows ──────────────────────────────────────────────

    unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
        // SAFETY: lparam is the `&mut Vec<HWND>` passed by `top_level_windows`.
        let list = unsafe { &mut *(lparam.0 as *mut Vec<HWND>) };
        list.push(hwnd);
        TRUE
    }

    fn top_level_windows() -> Vec<HWND> {
        let mut list: Vec<HWND> = Vec::new();
        let lparam = LPARAM(&mut list as *mut Vec<HWND> as isize);
        if let Err(e) = unsafe { EnumWindows(Some(collect_window), lparam) } {
            debug!(error = %e, "EnumWindows stopped early");
        }
        list
    }

    fn window_rect(h: HWND) -> Option<Rect> {
        let mut r = RECT::default();
        unsafe { GetWindowRect(h, &mut r) }.ok()?;
        Some(rect_from(r))
    }

    fn is_cloaked(h: HWND) -> bool {
        let mut cloaked: u32 = 0;
        unsafe {
            DwmGetWindowAttribute(
                h,
                DWMWA_CLOAKED,
                &mut cloaked as *mut u32 as *mut c_void,
                size_of::<u32>() as u32,
            )
        }
        .map(|()| cloaked != 0)
        .unwrap_or(false)
    }

    fn output_index_for(monitor: HMONITOR, outputs: &[OutputEntry]) -> Option<u32> {
        if monitor.is_invalid() {
            return None;
        }
        outputs
            .iter()
            .position(|o| o.desc.Monitor == monitor)
            .map(|i| i as u32)
    }

    fn describe_window(h: HWND, outputs: &[OutputEntry]) -> Option<WindowInfo> {
        let mut title = [0u16; 512];
        let mut class = [0u16; 256];
        let title_len = unsafe { GetWindowTextW(h, &mut title) }.max(0) as usize;
        let class_len = unsafe { GetClassNameW(h, &mut class) }.max(0) as usize;
        let title = String::from_utf16_lossy(&title[..title_len]);
        let class_name = String::from_utf16_lossy(&class[..class_len]);
        let ex_style = unsafe { GetWindowLongW(h, GWL_EXSTYLE) } as u32;
        let rect = window_rect(h)?;

        let candidate = WindowCandidate {
            title: &title,
            class_name: &class_name,
            visible: unsafe { IsWindowVisible(h) }.as_bool(),
            minimized: unsafe { IsIconic(h) }.as_bool(),
            cloaked: is_cloaked(h),
            tool_window: ex_style & WS_EX_TOOLWINDOW.0 != 0,
            app_window: ex_style & WS_EX_APPWINDOW.0 != 0,
            rect,
        };
        if !is_capturable(&candidate) {
            return None;
        }

        let monitor = output_index_for(unsafe { MonitorFromWindow(h, MONITOR_DEFAULTTONULL) }, outputs);
        Some(WindowInfo {
            handle: WindowHandle(h.0 as usize as u64),
            title,
            class_name,
            rect,
            monitor,
        })
    }

    // ── Backend ──────────────────────────────────────────────

    impl DxgiBackend {
        pub fn new() -> Self {
            Self {
                session: None,
                held: false,
            }
        }
    }

    impl CaptureBackend for DxgiBackend {
        fn name(&self) -> &'static str {
            "dxgi"
        }

        fn bind(&mut self, index: u32) -> Result<MonitorInfo, CaptureError> {
            self.unbind();
            let outputs = enumerate_outputs()?;
            let entry = outputs
                .get(index as usize)
                .ok_or(CaptureError::MonitorNotFound(index))?;
            self.session = Some(Session::open(entry)?);
            Ok(monitor_info(index as usize, &entry.desc))
        }

        fn unbind(&mut self) {
            self.release_frame();
            self.session = None;
        }

        fn acquire(&mut self, timeout: Duration) -> Result<Option<AcquiredFrame>, CaptureError> {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| CaptureError::Unavailable("not bound".into()))?;
            let frame = session.acquire(timeout)?;
            self.held = frame.is_some();
            Ok(frame)
        }

        fn copy_to_host(&mut self, dst: &mut RawFrame) -> Result<(), CaptureError> {
            match &mut self.session {
                Some(s) if self.held => s.copy_to_host(dst),
                _ => Err(CaptureError::NoFrameHeld),
            }
        }

        fn release_frame(&mut self) {
            if let Some(s) = &mut self.session {
                s.release();
            }
            self.held = false;
        }

        fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
            Ok(enumerate_outputs()?
                .iter()
                .enumerate()
                .map(|(i, o)| monitor_info(i, &o.desc))
                .collect())
        }

        fn windows(&self) -> Result<Vec<WindowInfo>, CaptureError> {
            let outputs = enumerate_outputs()?;
            let mut list: Vec<WindowInfo> = top_level_windows()
                .into_iter()
                .filter_map(|h| describe_window(h, &outputs))
                .collect();
            list.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
            Ok(list)
        }

        fn window_rect(&self, handle: WindowHandle) -> Option<Rect> {
            let h = hwnd(handle);
            if !unsafe { IsWindow(h) }.as_bool() {
                return None;
            }
            window_rect(h)
        }

        fn monitor_for_window(&self, handle: WindowHandle) -> Option<u32> {
            let h = hwnd(handle);
            if !unsafe { IsWindow(h) }.as_bool() {
                return None;
            }
            let outputs = enumerate_outputs().ok()?;
            output_index_for(unsafe { MonitorFromWindow(h, MONITOR_DEFAULTTONULL) }, &outputs)
        }
    }

    // SAFETY: the D3D11 objects are only touched from the thread that
    // currently owns the backend; it is moved between threads, never shared.
    unsafe impl Send for DxgiBackend {}
}

// ── Non-Windows stub ─────────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
impl DxgiBackend {
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(not(target_os = "windows"))]
impl CaptureBackend for DxgiBackend {
    fn name(&self) -> &'static str {
        "dxgi"
    }

    fn bind(&mut self, _index: u32) -> Result<MonitorInfo, CaptureError> {
        Err(CaptureError::Unavailable(
            "DXGI Desktop Duplication is only available on Windows".into(),
        ))
    }

    fn unbind(&mut self) {}

    fn acquire(&mut self, _timeout: Duration) -> Result<Option<AcquiredFrame>, CaptureError> {
        Err(CaptureError::Unavailable("not bound".into()))
    }

    fn copy_to_host(&mut self, _dst: &mut RawFrame) -> Result<(), CaptureError> {
        Err(CaptureError::NoFrameHeld)
    }

    fn release_frame(&mut self) {}

    fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
        Ok(Vec::new())
    }

    fn windows(&self) -> Result<Vec<WindowInfo>, CaptureError> {
        Ok(Vec::new())
    }

    fn window_rect(&self, _handle: WindowHandle) -> Option<Rect> {
        None
    }

    fn monitor_for_window(&self, _handle: WindowHandle) -> Option<u32> {
        None
    }
}

impl Default for DxgiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;

    #[test]
    fn stub_reports_unavailable() {
        let mut backend = DxgiBackend::new();
        assert!(matches!(backend.bind(0), Err(CaptureError::Unavailable(_))));
        assert!(backend.monitors().unwrap().is_empty());
    }
}
