use std::sync::Arc;

use ff_common::{Format, Rotation, WindowSize};

use crate::{
    backend::{ResourceFlags, ResourceStates},
    commands::Commands,
    error::{Error, Result},
    resource::Resource,
    target::Target,
};

/// Renders into array slices of one mip of a texture.
#[derive(Debug)]
pub struct TargetTexture {
    texture: Arc<Resource>,
    array_start: usize,
    array_count: usize,
    mip_level: usize,
    native_rotation: Rotation,
    current_rotation: Rotation,
    dpi_scale: f64,
}

impl TargetTexture {
    /// An `array_count` of zero targets every slice from `array_start` on.
    pub fn new(
        texture: Arc<Resource>,
        array_start: usize,
        array_count: usize,
        mip_level: usize,
    ) -> Result<Self> {
        let desc = *texture.desc();
        if desc.is_buffer() || !desc.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
            return Err(Error::InvalidArgument("texture cannot be rendered to"));
        }

        let array_size = desc.array_size as usize;
        let array_count = match array_count {
            0 => array_size.saturating_sub(array_start),
            count => count,
        };
        if array_count == 0
            || array_start + array_count > array_size
            || mip_level >= desc.mip_levels as usize
        {
            return Err(Error::InvalidArgument("target range is outside the texture"));
        }

        Ok(Self {
            texture,
            array_start,
            array_count,
            mip_level,
            native_rotation: Rotation::Rotate0,
            current_rotation: Rotation::Rotate0,
            dpi_scale: 1.0,
        })
    }

    /// Treats the texture as a surface shown on a rotated display.
    pub fn with_display(mut self, native: Rotation, current: Rotation, dpi_scale: f64) -> Self {
        self.native_rotation = native;
        self.current_rotation = current;
        self.dpi_scale = if dpi_scale > 0.0 { dpi_scale } else { 1.0 };
        self
    }

    pub fn shared_texture(&self) -> &Arc<Resource> {
        &self.texture
    }

    /// Prepares the texture for a frame, clearing it or marking its contents undefined.
    pub fn begin_render(
        &self,
        commands: &mut Commands,
        clear_color: Option<[f32; 4]>,
    ) -> Result<()> {
        match clear_color {
            Some(color) => self.clear(commands, color),
            None => self.discard(commands),
        }
    }

    /// Hands the texture back for sampling or copying.
    pub fn end_render(&self, commands: &mut Commands) {
        commands.transition(&self.texture, ResourceStates::PRESENT);
    }
}

impl Target for TargetTexture {
    fn format(&self) -> Format {
        self.texture.desc().format
    }

    fn size(&self) -> WindowSize {
        let mut size = WindowSize {
            pixel_size: self.texture.desc().subresource_size(self.mip_level),
            dpi_scale: self.dpi_scale,
            native_rotation: self.native_rotation,
            current_rotation: self.current_rotation,
        };
        size.pixel_size = size.rotated_pixel_size();
        size
    }

    fn target_array_start(&self) -> usize {
        self.array_start
    }

    fn target_array_size(&self) -> usize {
        self.array_count
    }

    fn target_mip_start(&self) -> usize {
        self.mip_level
    }

    fn target_mip_size(&self) -> usize {
        1
    }

    fn clear(&self, commands: &mut Commands, color: [f32; 4]) -> Result<()> {
        commands.clear_resource(&self.texture, color)
    }

    fn discard(&self, commands: &mut Commands) -> Result<()> {
        commands.discard_resource(&self.texture)
    }
}
