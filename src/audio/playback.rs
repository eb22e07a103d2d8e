//! Speaker playback using CPAL.
//!
//! `play` converts frames on the caller's thread and hands them to the
//! output callback over a crossbeam channel; the callback owns the
//! `PlaybackQueue` and never blocks.

use crate::audio::capture::with_suppressed_stderr;
use crate::audio::lease::{Device, DeviceLease};
use crate::audio::pcm::{self, PcmFrame};
use crate::audio::player::{AudioSink, PlaybackQueue};
use crate::error::{ReflectaError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{info, warn};

/// Messages from `CpalPlayback` to the output callback.
enum PlaybackCommand {
    Enqueue(Vec<f32>),
    Clear,
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched from `CpalPlayback`'s `&mut self`
/// methods.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

struct OutputStream {
    stream: SendableStream,
    commands: Sender<PlaybackCommand>,
    device_rate: u32,
    _lease: DeviceLease,
}

/// Playback pipeline backed by the default (or named) output device.
///
/// The output stream opens lazily on the first frame and stays open,
/// playing silence while idle, until `stop`.
pub struct CpalPlayback {
    device: Option<String>,
    output: Option<OutputStream>,
}

impl CpalPlayback {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            output: None,
        }
    }

    fn select_output_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match self.device.as_deref() {
            Some(name) => {
                let devices = host
                    .output_devices()
                    .map_err(|e| ReflectaError::AudioPlayback {
                        message: format!("Failed to enumerate output devices: {}", e),
                    })?;
                for device in devices {
                    if let Ok(device_name) = device.name()
                        && device_name == name
                    {
                        return Ok(device);
                    }
                }
                Err(ReflectaError::AudioDeviceNotFound {
                    device: name.to_string(),
                })
            }
            None => host
                .default_output_device()
                .ok_or_else(|| ReflectaError::AudioDeviceNotFound {
                    device: "default output".to_string(),
                }),
        }
    }

    fn open(&self) -> Result<OutputStream> {
        use cpal::SampleFormat;

        let device = with_suppressed_stderr(|| self.select_output_device())?;
        let lease = DeviceLease::acquire(Device::Speaker)?;
        let default_config =
            device
                .default_output_config()
                .map_err(|e| ReflectaError::AudioPlayback {
                    message: format!("Failed to query default output config: {}", e),
                })?;

        let device_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let stream_config: cpal::StreamConfig = default_config.clone().into();
        let (commands, receiver) = unbounded();

        let err_callback = |err: cpal::StreamError| {
            warn!(error = %err, "speaker stream error");
        };

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => {
                let mut queue = PlaybackQueue::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        apply_commands(&receiver, &mut queue);
                        queue.fill(data, channels);
                    },
                    err_callback,
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut queue = PlaybackQueue::new();
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        apply_commands(&receiver, &mut queue);
                        scratch.resize(data.len(), 0.0);
                        queue.fill(&mut scratch, channels);
                        for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                            *out = pcm::f32_to_i16(sample);
                        }
                    },
                    err_callback,
                    None,
                )
            }
            fmt => {
                return Err(ReflectaError::AudioPlayback {
                    message: format!("Unsupported output sample format: {:?}", fmt),
                });
            }
        }
        .map_err(|e| ReflectaError::AudioPlayback {
            message: format!("Failed to build output stream: {}", e),
        })?;

        stream.play().map_err(|e| ReflectaError::AudioPlayback {
            message: format!("Failed to start output stream: {}", e),
        })?;

        info!(rate = device_rate, channels, "speaker playback opened");
        Ok(OutputStream {
            stream: SendableStream(stream),
            commands,
            device_rate,
            _lease: lease,
        })
    }
}

fn apply_commands(receiver: &Receiver<PlaybackCommand>, queue: &mut PlaybackQueue) {
    for command in receiver.try_iter() {
        match command {
            PlaybackCommand::Enqueue(samples) => queue.enqueue(samples),
            PlaybackCommand::Clear => queue.clear(),
        }
    }
}

impl AudioSink for CpalPlayback {
    fn play(&mut self, frame: PcmFrame) -> Result<()> {
        if self.output.is_none() {
            self.output = Some(self.open()?);
        }
        let Some(output) = self.output.as_ref() else {
            return Err(ReflectaError::AudioPlayback {
                message: "output stream unavailable".to_string(),
            });
        };

        let samples: Vec<f32> = frame.samples.iter().map(|&s| pcm::i16_to_f32(s)).collect();
        let converted = pcm::resample_f32(&samples, frame.sample_rate, output.device_rate);
        output
            .commands
            .send(PlaybackCommand::Enqueue(converted))
            .map_err(|_| ReflectaError::AudioPlayback {
                message: "output callback is gone".to_string(),
            })
    }

    fn stop(&mut self) -> Result<()> {
        let Some(output) = self.output.take() else {
            return Ok(());
        };
        if output.commands.send(PlaybackCommand::Clear).is_err() {
            // Callback already gone - nothing left to clear
        }
        let paused = output.stream.0.pause();
        drop(output);
        info!("speaker playback stopped");

        paused.map_err(|e| ReflectaError::AudioPlayback {
            message: format!("Failed to stop output stream: {}", e),
        })
    }

    fn is_active(&self) -> bool {
        self.output.is_some()
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "speaker release failed during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_apply_in_send_order() {
        let (tx, rx) = unbounded();
        let mut queue = PlaybackQueue::new();

        tx.send(PlaybackCommand::Enqueue(vec![0.1])).unwrap();
        tx.send(PlaybackCommand::Clear).unwrap();
        tx.send(PlaybackCommand::Enqueue(vec![0.2])).unwrap();
        apply_commands(&rx, &mut queue);

        assert_eq!(queue.next_sample(), Some(0.2));
        assert_eq!(queue.next_sample(), None);
    }

    #[test]
    fn test_stop_without_play_is_noop() {
        let mut playback = CpalPlayback::new(None);
        assert!(playback.stop().is_ok());
        assert!(playback.stop().is_ok());
        assert!(!playback.is_active());
    }

    #[test]
    fn test_unknown_output_device_is_reported() {
        let mut playback = CpalPlayback::new(Some("NonExistentSpeaker12345".to_string()));
        let result = playback.play(PcmFrame::new(vec![0; 240], 24000));
        assert!(result.is_err());
        assert!(!playback.is_active());
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_play_opens_stream_and_stop_releases_speaker() {
        let mut playback = CpalPlayback::new(None);
        playback
            .play(PcmFrame::new(vec![0; 2400], 24000))
            .expect("Failed to play");
        assert!(playback.is_active());
        assert!(DeviceLease::is_held(Device::Speaker));

        playback.stop().expect("Failed to stop");
        assert!(!playback.is_active());
        assert!(!DeviceLease::is_held(Device::Speaker));
    }
}
