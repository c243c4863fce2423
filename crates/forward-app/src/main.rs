// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use forward_core::{init_tracing, FpsCounter};
use forward_render::{PresentPreference, RenderConfig, RenderSize, Renderer};
use forward_render_vk::VkRenderer;
use tracing::{debug, error, info, warn};

use forward_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; defaults are used when it does not exist
    #[arg(long, default_value = "forward.toml")]
    config: PathBuf,
    /// Exit cleanly after this many presented frames
    #[arg(long)]
    max_frames: Option<u64>,
    /// Overrides `render.present_mode` from the config file
    #[arg(long, value_enum)]
    present_mode: Option<PresentMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum PresentMode {
    Fifo,
    #[default]
    Mailbox,
}

impl From<PresentMode> for PresentPreference {
    fn from(m: PresentMode) -> Self {
        match m {
            PresentMode::Fifo => PresentPreference::Fifo,
            PresentMode::Mailbox => PresentPreference::Mailbox,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct RenderCfg {
    #[serde(default = "default_clear")]
    clear_color: [f32; 4],
    #[serde(default)]
    present_mode: PresentMode,
    #[serde(default)]
    validation: Option<bool>,
    #[serde(default)]
    shader_dir: Option<PathBuf>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            present_mode: PresentMode::Mailbox,
            validation: None,
            shader_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

impl AppCfg {
    fn into_render_config(self, present_override: Option<PresentMode>) -> RenderConfig {
        let r = self.render;
        RenderConfig {
            clear_color: r.clear_color,
            present: present_override.unwrap_or(r.present_mode).into(),
            validation: r.validation.unwrap_or(cfg!(debug_assertions)),
            shader_dir: r.shader_dir,
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.0, 0.0, 0.0, 0.0]
}

fn parse_cfg(s: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(s)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("ignoring {}: {e}", path.display());
            AppCfg::default()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} not found, using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("cannot read {}: {e}", path.display());
            AppCfg::default()
        }
    }
}

struct App {
    cfg: RenderConfig,
    max_frames: Option<u64>,

    // Renderer before window: the surface must go first.
    renderer: Option<VkRenderer>,
    window: Option<Window>,

    fps: FpsCounter,
    exiting: bool,
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: RenderConfig, max_frames: Option<u64>) -> Self {
        App {
            cfg,
            max_frames,
            renderer: None,
            window: None,
            fps: FpsCounter::default(),
            exiting: false,
            fatal: None,
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.fatal = Some(err);
        self.shutdown(event_loop);
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop
            .create_window(forward_platform::window_attributes())
            .context("create_window")?;

        let size = window.inner_size();
        let size = RenderSize {
            width: size.width,
            height: size.height,
        };

        let renderer =
            VkRenderer::new(&window, &window, size, &self.cfg).context("renderer init")?;
        info!(
            "renderer up: present={:?} validation={}",
            self.cfg.present,
            renderer.validation_enabled()
        );

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() && !self.exiting {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
            self.fps.reset(Instant::now());
        }

        // Pacing comes from the present mode.
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                debug!("Resized → {}x{}", size.width, size.height);
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(size) {
                        self.fail(event_loop, e.context("resize"));
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                let Some(r) = &mut self.renderer else {
                    return;
                };

                let before = r.frames_presented();
                if let Err(e) = r.render() {
                    self.fail(event_loop, e.context("render"));
                    return;
                }

                let presented = r.frames_presented();
                if presented > before {
                    self.fps.frame();
                }
                if self.max_frames.is_some_and(|max| presented >= max) {
                    info!("presented {presented} frames, exiting");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }
        if let Some(fps) = self.fps.poll(Instant::now()) {
            info!("fps ~ {fps}");
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config).into_render_config(args.present_mode);
    debug!("config: {cfg:?}");

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, args.max_frames);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => {
            info!("clean shutdown after {} frames", app.fps.total());
            Ok(())
        }
    }
}
