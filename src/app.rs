use crate::config::Config;
use cgmath::{Matrix4, SquareMatrix, Vector3};
use image::{Rgba, RgbaImage};
use log::{error, info};
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;
use strobe::core::gfx::{Display, RenderQuad, SamplerDesc, SamplerFilter, SamplerWrap, TextureHandle};
use strobe::core::space::ortho_for_window;
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowId},
};

/// A small stand-in for the game's actor system: opens a window, brings up
/// the renderer, and submits an animated quad scene every frame.
struct App {
    config: Config,
    window: Option<Arc<Window>>,
    display: Option<Display>,
    checker: Option<TextureHandle>,
    gradient: Option<TextureHandle>,
    start: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            display: None,
            checker: None,
            gradient: None,
            start: Instant::now(),
        }
    }

    fn init_graphics(&mut self, event_loop: &ActiveEventLoop) -> Result<(), Box<dyn Error>> {
        let attributes = Window::default_attributes()
            .with_title("strobe")
            .with_inner_size(LogicalSize::new(
                self.config.window_width,
                self.config.window_height,
            ));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let mut display = Display::init(&window, self.config.vsync, self.config.gfx_debug)?;
        info!(
            "renderer: {} (max texture size {})",
            display.api_description(),
            display.max_texture_size()
        );

        self.checker = Some(display.create_texture(
            &checkerboard(64, 8),
            SamplerDesc {
                filter: SamplerFilter::Nearest,
                wrap: SamplerWrap::Repeat,
            },
        )?);
        self.gradient = Some(display.create_texture(&gradient(128), SamplerDesc::default())?);

        self.window = Some(window);
        self.display = Some(display);
        Ok(())
    }

    fn draw_frame(&mut self) {
        let Some(display) = self.display.as_mut() else {
            return;
        };
        let Some(window) = self.window.as_ref() else {
            return;
        };
        if let Err(e) = display.begin_frame() {
            error!("begin_frame failed: {e}");
            return;
        }

        let size = window.inner_size();
        display.set_projection(ortho_for_window(size.width, size.height));
        display.set_view(Matrix4::identity());

        let t = self.start.elapsed().as_secs_f32();
        let (w, h) = (size.width as f32, size.height as f32);

        // Full-window untextured backdrop, corner-shaded.
        display.set_texture(None);
        display.set_world(Matrix4::identity());
        display.push_quads(&[RenderQuad {
            rect: [0.0, 0.0, w, h],
            uv_rect: [0.0, 0.0, 1.0, 1.0],
            colors: [
                [24, 24, 48, 255],
                [24, 48, 64, 255],
                [16, 16, 32, 255],
                [40, 24, 56, 255],
            ],
        }]);

        // A row of gradient sprites bobbing on their world transforms.
        display.set_texture(self.gradient);
        for i in 0..8 {
            let phase = t * 2.0 + i as f32 * 0.7;
            let x = w * (0.15 + 0.1 * i as f32);
            let y = h * 0.5 + phase.sin() * h * 0.2;
            display.set_world(Matrix4::from_translation(Vector3::new(x, y, 0.0)));
            display.push_quads(&[centered_quad(48.0, [255, 255, 255, 230])]);
        }

        // One scrolling checkerboard using the texture translate path.
        display.set_texture(self.checker);
        display.set_texture_translate(t * 0.25, 0.0);
        display.set_world(Matrix4::from_translation(Vector3::new(
            w * 0.5,
            h * 0.85,
            0.0,
        )));
        display.push_quads(&[RenderQuad {
            rect: [-w * 0.4, -24.0, w * 0.4, 24.0],
            uv_rect: [0.0, 0.0, 8.0, 1.0],
            colors: [[255; 4]; 4],
        }]);
        display.set_texture_translate(0.0, 0.0);

        if let Err(e) = display.end_frame() {
            error!("end_frame failed: {e}");
        }
    }

    fn shutdown_graphics(&mut self) {
        if let Some(mut display) = self.display.take() {
            display.cleanup();
        }
        self.window = None;
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.display.is_some() {
            return;
        }
        if let Err(e) = self.init_graphics(event_loop) {
            error!("failed to initialize the Vulkan renderer: {e}");
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                self.shutdown_graphics();
                event_loop.exit();
            }
            WindowEvent::Resized(_) => {
                if let Some(display) = self.display.as_mut() {
                    display.resolution_changed();
                }
            }
            WindowEvent::RedrawRequested => {
                self.draw_frame();
                if let Some(window) = self.window.as_ref() {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown_graphics();
    }
}

pub fn run(config: Config) -> Result<(), Box<dyn Error>> {
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// A quad centered on the current world translation.
fn centered_quad(half: f32, color: [u8; 4]) -> RenderQuad {
    RenderQuad {
        rect: [-half, -half, half, half],
        uv_rect: [0.0, 0.0, 1.0, 1.0],
        colors: [color; 4],
    }
}

fn checkerboard(size: u32, cell: u32) -> RgbaImage {
    RgbaImage::from_fn(size, size, |x, y| {
        if ((x / cell) + (y / cell)) % 2 == 0 {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([40, 40, 40, 255])
        }
    })
}

fn gradient(size: u32) -> RgbaImage {
    RgbaImage::from_fn(size, size, |x, y| {
        let r = (x * 255 / size.max(1)) as u8;
        let g = (y * 255 / size.max(1)) as u8;
        Rgba([r, g, 200, 255])
    })
}
