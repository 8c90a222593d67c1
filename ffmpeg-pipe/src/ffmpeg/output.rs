use std::{ffi::CString, path::Path};

use ffmpeg_next::{ffi, format::context};

use crate::{
    error::{PipelineError, Result},
    output::{PacketWriter, WriteError},
    packet::Packet,
    source::PacketSource,
    timebase::Timebase,
};

use super::input::FfmpegSource;

/// Container writer for the stream copy. The muxer is picked from the path extension.
pub struct FfmpegWriter {
    path: String,
    inner: Option<context::Output>,
    time_bases: Vec<Option<Timebase>>,
}

unsafe impl Send for FfmpegWriter {}

impl FfmpegWriter {
    /// Allocates the container, adds one stream per source stream with the codec
    /// parameters copied, opens the destination and writes the header.
    pub fn create(path: &Path, source: &FfmpegSource) -> Result<Self> {
        let display = path.display().to_string();
        let create_failed = |reason: String| PipelineError::OutputCreateFailed {
            path: display.clone(),
            reason,
        };
        let cpath = CString::new(display.as_str()).map_err(|e| create_failed(e.to_string()))?;

        let mut output = unsafe {
            let mut ctx = std::ptr::null_mut();
            let res = ffi::avformat_alloc_output_context2(
                &mut ctx,
                std::ptr::null_mut(),
                std::ptr::null(),
                cpath.as_ptr(),
            );
            if res < 0 || ctx.is_null() {
                return Err(create_failed(ffmpeg_next::Error::from(res).to_string()));
            }
            context::Output::wrap(ctx)
        };

        for stream in source.streams() {
            let parameters = source
                .parameters(stream.index())
                .ok_or_else(|| {
                    create_failed(format!("no parameters for stream {}", stream.index()))
                })?;
            let mut out = output
                .add_stream(ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::None))
                .map_err(|e| create_failed(e.to_string()))?;
            out.set_parameters(parameters);
            out.set_time_base(ffmpeg_next::Rational::from(stream.time_base()));
            unsafe {
                // the input's tag may not be valid in the target container
                (*(*out.as_mut_ptr()).codecpar).codec_tag = 0;
            }
        }

        unsafe {
            let format = (*output.as_ptr()).oformat;
            let nofile = !format.is_null() && ((*format).flags & ffi::AVFMT_NOFILE as i32) != 0;
            if !nofile {
                let res = ffi::avio_open(
                    &mut (*output.as_mut_ptr()).pb,
                    cpath.as_ptr(),
                    ffi::AVIO_FLAG_WRITE as i32,
                );
                if res < 0 {
                    return Err(PipelineError::OutputOpenFailed {
                        path: display,
                        reason: ffmpeg_next::Error::from(res).to_string(),
                    });
                }
            }
        }

        output
            .write_header()
            .map_err(|e| PipelineError::HeaderWriteFailed(e.to_string()))?;

        // the muxer may have replaced the timebases while writing the header
        let slots = source.streams().iter().map(|s| s.index() + 1).max().unwrap_or(0);
        let mut time_bases = vec![None; slots];
        for (out, stream) in output.streams().zip(source.streams()) {
            time_bases[stream.index()] = Some(Timebase::from(out.time_base()));
        }
        log::info!("output {} opened, header written", display);

        Ok(Self {
            path: display,
            inner: Some(output),
            time_bases,
        })
    }
}

impl PacketWriter for FfmpegWriter {
    fn time_base(&self, stream_index: usize) -> Option<Timebase> {
        self.time_bases.get(stream_index).copied().flatten()
    }

    fn write_interleaved(&mut self, packet: Packet) -> std::result::Result<(), WriteError> {
        let Some(output) = self.inner.as_mut() else {
            return Err(WriteError::Fatal("output closed".to_string()));
        };
        let mut raw = ffmpeg_next::Packet::copy(packet.data());
        raw.set_stream(packet.stream_index());
        raw.set_pts(packet.pts());
        raw.set_dts(packet.dts());
        raw.set_duration(packet.duration());
        raw.set_position(packet.position().map(|p| p as isize).unwrap_or(-1));
        if packet.is_key() {
            raw.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        raw.write_interleaved(output).map_err(|e| {
            if super::is_fatal_io(&e) {
                WriteError::Fatal(e.to_string())
            } else {
                WriteError::Packet(e.to_string())
            }
        })
    }

    fn write_trailer(&mut self) -> std::result::Result<(), WriteError> {
        match self.inner.as_mut() {
            Some(output) => output.write_trailer().map_err(|e| WriteError::Fatal(e.to_string())),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        let Some(mut output) = self.inner.take() else {
            return;
        };
        unsafe {
            let format = (*output.as_ptr()).oformat;
            let nofile = !format.is_null() && ((*format).flags & ffi::AVFMT_NOFILE as i32) != 0;
            if !nofile {
                ffi::avio_closep(&mut (*output.as_mut_ptr()).pb);
            }
        }
        drop(output);
        log::info!("output {} closed", self.path);
    }
}
