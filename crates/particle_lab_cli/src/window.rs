//! Live presentation through a winit window

use anyhow::{anyhow, Result};
use std::sync::Arc;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use particle_lab::{FrameDriver, GpuContext, RenderTarget, SimulationConfig};

use crate::LogObserver;

/// Open a window and step the simulation on every redraw
pub fn run(config: SimulationConfig) -> Result<()> {
    let event_loop = EventLoop::new().map_err(|e| anyhow!("Failed to create event loop: {}", e))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ParticleWindow {
        config,
        window: None,
        driver: None,
        failure: None,
    };
    event_loop
        .run_app(&mut app)
        .map_err(|e| anyhow!("Event loop failed: {}", e))?;

    match app.failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

struct ParticleWindow {
    config: SimulationConfig,
    window: Option<Arc<Window>>,
    driver: Option<FrameDriver>,
    failure: Option<anyhow::Error>,
}

impl ParticleWindow {
    fn open(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let (width, height) = self.config.target_extent();
        let attributes = Window::default_attributes()
            .with_title("Particle Lab")
            .with_inner_size(PhysicalSize::new(width, height));
        let window = Arc::new(
            event_loop
                .create_window(attributes)
                .map_err(|e| anyhow!("Failed to create window: {}", e))?,
        );

        let (gpu, surface) = GpuContext::with_surface(Arc::clone(&window))?;
        let size = window.inner_size();
        let target = RenderTarget::surface(&gpu, surface, size.width, size.height);
        let driver = FrameDriver::new(gpu, self.config.clone(), target, Box::new(LogObserver))?;

        window.request_redraw();
        self.window = Some(window);
        self.driver = Some(driver);
        Ok(())
    }
}

impl ApplicationHandler for ParticleWindow {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.open(event_loop) {
            tracing::error!("{:#}", e);
            self.failure = Some(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                // Drain in-flight frames while the surface is still alive
                self.driver = None;
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(driver) = self.driver.as_mut() {
                    driver.resize_surface(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                if let Some(driver) = self.driver.as_mut() {
                    driver.step();
                }
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }

            _ => {}
        }
    }
}
