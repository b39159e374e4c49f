use webrtc::{
    api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMU, MIME_TYPE_VP8},
    error::Result,
    rtp_transceiver::{
        rtp_codec::{
            RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability,
            RTPCodecType,
        },
        RTCPFeedback,
    },
    sdp::extmap,
};

pub(crate) const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

fn codec(
    mime_type: &str,
    clock_rate: u32,
    channels: u16,
    sdp_fmtp_line: &str,
    rtcp_feedback: Vec<RTCPFeedback>,
    payload_type: u8,
) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate,
            channels,
            sdp_fmtp_line: sdp_fmtp_line.to_owned(),
            rtcp_feedback,
        },
        payload_type,
        ..Default::default()
    }
}

pub fn register_default_codecs(me: &mut MediaEngine) -> Result<()> {
    let audio_codecs = vec![
        codec(MIME_TYPE_OPUS, 48000, 2, OPUS_FMTP, vec![], 111),
        codec(MIME_TYPE_PCMU, 8000, 0, "", vec![], 0),
    ];

    let video_rtcp_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];
    let video_codecs = vec![
        codec(MIME_TYPE_VP8, 90000, 0, "", video_rtcp_feedback.clone(), 96),
        codec("video/rtx", 90000, 0, "apt=96", vec![], 97),
        codec(
            MIME_TYPE_H264,
            90000,
            0,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            video_rtcp_feedback,
            125,
        ),
        codec("video/rtx", 90000, 0, "apt=125", vec![], 107),
    ];

    for codec in audio_codecs {
        me.register_codec(codec, RTPCodecType::Audio)?;
    }

    for codec in video_codecs {
        me.register_codec(codec, RTPCodecType::Video)?;
    }

    Ok(())
}

pub fn register_extensions(media_engine: &mut MediaEngine) -> Result<()> {
    let extensions = [
        (extmap::SDES_MID_URI, RTPCodecType::Audio),
        (extmap::AUDIO_LEVEL_URI, RTPCodecType::Audio),
        (extmap::SDES_MID_URI, RTPCodecType::Video),
        (extmap::ABS_SEND_TIME_URI, RTPCodecType::Video),
    ];

    for (uri, kind) in extensions {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: uri.to_owned(),
            },
            kind,
            None,
        )?;
    }
    Ok(())
}
