//! Demo binary: a spinning triangle driven through the frame pacer.

use anyhow::Result;
use glam::Mat4;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use pacer_core::Timer;
use pacer_platform::Window;
use pacer_renderer::{FrameUniform, Renderer};

struct App {
    window: Option<Window>,
    renderer: Option<Renderer>,
    timer: Timer,
}

impl App {
    fn new() -> Self {
        Self {
            window: None,
            renderer: None,
            timer: Timer::new(),
        }
    }

    /// Per-frame uniform data: a slow spin around Z and a breathing tint.
    fn frame_uniform(&self) -> FrameUniform {
        let time = self.timer.elapsed_secs();
        let spin = Mat4::from_rotation_z(time * 0.8);
        let pulse = 0.75 + 0.25 * (time * 2.0).sin();

        FrameUniform {
            transform: spin.to_cols_array_2d(),
            tint: [pulse, pulse, pulse, 1.0],
            time,
            ..FrameUniform::identity()
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            match Window::new(event_loop, 1280, 720, "Pacer") {
                Ok(window) => match Renderer::new(&window) {
                    Ok(renderer) => {
                        info!("Initialization complete, entering main loop");
                        self.renderer = Some(renderer);
                        self.window = Some(window);
                    }
                    Err(e) => {
                        error!("Failed to create renderer: {:?}", e);
                        event_loop.exit();
                    }
                },
                Err(e) => {
                    error!("Failed to create window: {}", e);
                    event_loop.exit();
                }
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                let uniform = self.frame_uniform();
                if let Some(ref mut renderer) = self.renderer
                    && let Err(e) = renderer.draw_frame(&uniform)
                {
                    error!("Render error, stopping: {:?}", e);
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    pacer_core::init_logging();
    info!("Starting pacer");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new();
    event_loop.run_app(&mut app)?;

    Ok(())
}
