//! Bring-up and configuration of a device handle over the mock transport

mod helpers;

use helpers::{position, Event, Mock, TunerCall};
use rs_rtl::{DeviceConfig, Error, TunerFamily};

fn demod(page: u8, addr: u16, data: &[u8]) -> Event {
    Event::write((addr << 8) | 0x20, 0x10 | page as u16, data)
}

fn without_dummy_reads(events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .filter(|e| !e.is_demod_dummy_read())
        .collect()
}

#[test]
fn test_baseband_init_sequence() {
    let mock = Mock::new();
    let _sdr = mock.open(DeviceConfig::default()).unwrap();

    let events = mock.events();
    let first_gate = events.iter().position(Event::is_gate).unwrap();
    let writes: Vec<Event> = events[..first_gate]
        .iter()
        .filter(|e| matches!(e, Event::WriteControl { .. }))
        .cloned()
        .collect();

    let fir = [
        0xca, 0xdc, 0xd7, 0xd8, 0xe0, 0xf2, 0x0e, 0x35, 0x06, 0x50, 0x9c, 0x0d, 0x71, 0x11, 0x14,
        0x71, 0x74, 0x19, 0x41, 0x00,
    ];

    let mut expected = vec![
        Event::write(0x2000, 0x0110, &[0x09]),
        Event::write(0x2158, 0x0110, &[0x00, 0x02]),
        Event::write(0x2148, 0x0110, &[0x10, 0x02]),
        Event::write(0x300b, 0x0210, &[0x22]),
        Event::write(0x3000, 0x0210, &[0xe8]),
        demod(1, 0x01, &[0x14]),
        demod(1, 0x01, &[0x10]),
        demod(1, 0x15, &[0x00]),
        demod(1, 0x16, &[0x00, 0x00]),
        demod(1, 0x19, &[0x00, 0x00]),
    ];
    for (i, &b) in fir.iter().enumerate() {
        expected.push(demod(1, 0x1c + i as u16, &[b]));
    }
    expected.extend([
        demod(0, 0x19, &[0x25]),
        demod(1, 0x93, &[0xf0]),
        demod(1, 0x11, &[0x00]),
        demod(0, 0x61, &[0x60]),
        demod(0, 0x06, &[0x80]),
        demod(1, 0xb1, &[0x1b]),
    ]);

    assert_eq!(writes, expected);
}

#[test]
fn test_every_demod_write_is_followed_by_dummy_read() {
    let mock = Mock::new();
    let _sdr = mock.open(DeviceConfig::default()).unwrap();

    let events = mock.events();
    let mut demod_writes = 0;
    for (i, e) in events.iter().enumerate() {
        if let Event::WriteControl { index, .. } = e {
            if index & 0xff00 == 0 {
                demod_writes += 1;
                assert!(events[i + 1].is_demod_dummy_read(), "no dummy read after {:?}", e);
            }
        }
    }
    assert!(demod_writes > 30);
}

#[test]
fn test_detection_prefers_e4000() {
    let mock = Mock::with_tuner(TunerFamily::E4000);
    // an FC2580 answering too must not be reached
    mock.set_i2c(0xac, 0x01, 0x56);
    let sdr = mock.open(DeviceConfig::default()).unwrap();

    assert_eq!(sdr.tuner_family(), Some(TunerFamily::E4000));
    let events = mock.events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::WriteControl { value: 0x0ac, index: 0x0610, .. })));
    // no reset pulse
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::WriteControl { value: 0x3001, .. })));
}

#[test]
fn test_detection_brackets_probes_and_init() {
    let mock = Mock::with_tuner(TunerFamily::Fc2580);
    let sdr = mock.open(DeviceConfig::default()).unwrap();
    assert_eq!(sdr.tuner_family(), Some(TunerFamily::Fc2580));

    let events = mock.events();
    let gates: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_gate())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(gates.len(), 2);
    assert_eq!(events[gates[0]], Event::gate(true));
    assert_eq!(events[gates[1]], Event::gate(false));

    let init = position(
        &events,
        &Event::Tuner {
            call: TunerCall::Init,
            gate_open: true,
        },
    )
    .unwrap();
    assert!(gates[0] < init && init < gates[1]);

    // reset pulse on GPIO 5 before the FC2580 probe
    let pulse_high = position(&events, &Event::write(0x3001, 0x0210, &[0x20])).unwrap();
    let pulse_low = position(&events, &Event::write(0x3001, 0x0210, &[0x00])).unwrap();
    let probe = position(&events, &Event::write(0xac, 0x0610, &[0x01])).unwrap();
    assert!(pulse_high < pulse_low && pulse_low < probe);
}

#[test]
fn test_failed_tuner_init_keeps_tuner_bound() {
    let mock = Mock::with_tuner(TunerFamily::Fc0013);
    mock.state().fail_init = true;
    let sdr = mock.open(DeviceConfig::default()).unwrap();

    assert_eq!(sdr.tuner_family(), Some(TunerFamily::Fc0013));
    assert_eq!(
        without_dummy_reads(mock.events()).last(),
        Some(&Event::gate(false))
    );
}

#[test]
fn test_open_fails_when_baseband_init_fails() {
    let mock = Mock::new();
    mock.state().fail_writes = true;

    assert!(matches!(
        mock.open(DeviceConfig::default()),
        Err(Error::ControlTransferFailed(_))
    ));
    // the interface is released on the way out
    assert_eq!(mock.events().last(), Some(&Event::Release));
}

#[test]
fn test_no_tuner_rejects_without_hardware_access() {
    let mock = Mock::new();
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    assert_eq!(sdr.tuner_family(), None);
    mock.clear();

    assert!(matches!(sdr.set_center_freq(100_000_000), Err(Error::NoTuner)));
    assert!(matches!(sdr.set_freq_correction(5), Err(Error::NoTuner)));
    assert!(matches!(sdr.set_tuner_gain(10), Err(Error::NoTuner)));
    assert!(matches!(sdr.get_center_freq(), Err(Error::NoTuner)));
    assert!(matches!(sdr.get_freq_correction(), Err(Error::NoTuner)));
    assert!(matches!(sdr.get_tuner_gain(), Err(Error::NoTuner)));
    assert!(mock.events().is_empty());
    assert_eq!(Error::NoTuner.code() as i32, -1);
}

#[test]
fn test_center_freq_is_gate_bracketed() {
    let mock = Mock::with_tuner(TunerFamily::E4000);
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    sdr.set_center_freq(100_000_000).unwrap();

    assert_eq!(
        without_dummy_reads(mock.events()),
        vec![
            Event::gate(true),
            Event::Tuner {
                call: TunerCall::Tune(100_000_000),
                gate_open: true
            },
            Event::gate(false),
        ]
    );
    assert_eq!(sdr.get_center_freq().unwrap(), 100_000_000);
}

#[test]
fn test_failed_tune_closes_gate_and_keeps_frequency() {
    let mock = Mock::with_tuner(TunerFamily::E4000);
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    sdr.set_center_freq(100_000_000).unwrap();
    mock.state().fail_tune = true;
    mock.clear();

    assert!(matches!(
        sdr.set_center_freq(200_000_000),
        Err(Error::Tuner {
            family: TunerFamily::E4000,
            ..
        })
    ));
    assert_eq!(
        without_dummy_reads(mock.events()).last(),
        Some(&Event::gate(false))
    );
    assert!(!mock.state().gate_open);
    assert_eq!(sdr.get_center_freq().unwrap(), 100_000_000);
}

#[test]
fn test_freq_correction_retunes() {
    let mock = Mock::with_tuner(TunerFamily::E4000);
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    sdr.set_center_freq(100_000_000).unwrap();
    mock.clear();

    sdr.set_freq_correction(10).unwrap();
    assert_eq!(mock.tuner_calls(), vec![TunerCall::Tune(100_001_000)]);
    assert_eq!(sdr.get_freq_correction().unwrap(), 10);
    assert_eq!(sdr.get_center_freq().unwrap(), 100_000_000);

    mock.clear();
    assert!(matches!(
        sdr.set_freq_correction(10),
        Err(Error::CorrectionUnchanged(10))
    ));
    assert!(mock.events().is_empty());

    sdr.set_freq_correction(-10).unwrap();
    assert_eq!(mock.tuner_calls(), vec![TunerCall::Tune(99_999_000)]);
}

#[test]
fn test_fc0012_band_switch_follows_frequency() {
    let mock = Mock::with_tuner(TunerFamily::Fc0012);
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    assert_eq!(sdr.tuner_family(), Some(TunerFamily::Fc0012));

    // GPIO 6 was made an output at detection
    assert_eq!(mock.state().sys_regs.get(&0x3003).copied(), Some(0x60));

    mock.clear();
    sdr.set_center_freq(433_920_000).unwrap();
    let events = mock.events();
    let gpio = position(&events, &Event::write(0x3001, 0x0210, &[0x40])).unwrap();
    let tune = position(
        &events,
        &Event::Tuner {
            call: TunerCall::Tune(433_920_000),
            gate_open: true,
        },
    )
    .unwrap();
    assert!(gpio < tune);

    mock.clear();
    sdr.set_center_freq(100_000_000).unwrap();
    assert!(position(&mock.events(), &Event::write(0x3001, 0x0210, &[0x00])).is_some());
}

#[test]
fn test_other_tuners_leave_band_gpio_alone() {
    let mock = Mock::with_tuner(TunerFamily::Fc0013);
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    sdr.set_center_freq(433_920_000).unwrap();
    assert!(!mock
        .events()
        .iter()
        .any(|e| matches!(e, Event::WriteControl { value: 0x3001, .. })));
}

#[test]
fn test_sample_rate_programs_resampler() {
    let mock = Mock::with_tuner(TunerFamily::Fc0013);
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    assert_eq!(sdr.get_sample_rate(), 0);
    mock.clear();

    let rate = sdr.set_sample_rate(2_048_000).unwrap();
    assert_eq!(rate.ratio, 0x0384_0000);

    assert_eq!(
        without_dummy_reads(mock.events()),
        vec![
            Event::gate(true),
            Event::Tuner {
                call: TunerCall::SetBandwidth(2_048_000),
                gate_open: true
            },
            Event::gate(false),
            demod(1, 0x9f, &[0x03, 0x84]),
            demod(1, 0xa1, &[0x00, 0x00]),
        ]
    );
    assert_eq!(sdr.get_sample_rate(), 2_048_000);
}

#[test]
fn test_sample_rate_clamps_and_ignores_bandwidth_failure() {
    let mock = Mock::with_tuner(TunerFamily::E4000);
    mock.state().fail_bandwidth = true;
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();

    let rate = sdr.set_sample_rate(8_000_000).unwrap();
    assert_eq!(rate.requested, 3_200_000);
    assert_eq!(sdr.get_sample_rate(), 3_200_000);
    assert!(!mock.state().gate_open);

    assert!(matches!(sdr.set_sample_rate(0), Err(Error::InvalidParam(_))));
    assert_eq!(sdr.get_sample_rate(), 3_200_000);
}

#[test]
fn test_sample_rate_without_tuner() {
    let mock = Mock::new();
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    sdr.set_sample_rate(2_400_000).unwrap();
    assert!(!mock.events().iter().any(Event::is_gate));
    assert_eq!(sdr.get_sample_rate(), 2_400_000);
}

#[test]
fn test_tuner_gain() {
    let mock = Mock::with_tuner(TunerFamily::Fc2580);
    let mut sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    sdr.set_tuner_gain(25).unwrap();
    assert_eq!(
        without_dummy_reads(mock.events()),
        vec![
            Event::gate(true),
            Event::Tuner {
                call: TunerCall::SetGain(25),
                gate_open: true
            },
            Event::gate(false),
        ]
    );
    assert_eq!(sdr.get_tuner_gain().unwrap(), 25);

    mock.state().fail_gain = true;
    assert!(sdr.set_tuner_gain(40).is_err());
    assert_eq!(sdr.get_tuner_gain().unwrap(), 25);
}

#[test]
fn test_reset_buffer() {
    let mock = Mock::new();
    let sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    sdr.reset_buffer().unwrap();
    assert_eq!(
        mock.events(),
        vec![
            Event::write(0x2148, 0x0110, &[0x10, 0x02]),
            Event::write(0x2148, 0x0110, &[0x00, 0x00]),
        ]
    );
}

#[test]
fn test_read_sync() {
    let mock = Mock::new();
    let sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.state().bulk_chunks.push_back(vec![7u8; 1024]);

    let mut buf = vec![0u8; 4096];
    assert_eq!(sdr.read_sync(&mut buf).unwrap(), 1024);
    assert!(buf[..1024].iter().all(|&b| b == 7));
    assert_eq!(mock.events().last(), Some(&Event::ReadBulk { len: 4096 }));
}

#[test]
fn test_close_without_tuner() {
    let mock = Mock::new();
    let sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    sdr.close().unwrap();
    assert_eq!(
        without_dummy_reads(mock.events()),
        vec![
            Event::gate(true),
            Event::gate(false),
            Event::write(0x3000, 0x0210, &[0x20]),
            Event::Release,
        ]
    );
}

#[test]
fn test_close_exits_tuner_inside_gate() {
    let mock = Mock::with_tuner(TunerFamily::E4000);
    let sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    sdr.close().unwrap();
    let events = without_dummy_reads(mock.events());
    assert_eq!(events[0], Event::gate(true));
    assert_eq!(
        events[1],
        Event::Tuner {
            call: TunerCall::Exit,
            gate_open: true
        }
    );
    assert_eq!(events[2], Event::gate(false));
    assert_eq!(events.last(), Some(&Event::Release));
}

#[test]
fn test_teardown_runs_every_step_despite_failures() {
    let mock = Mock::with_tuner(TunerFamily::E4000);
    let sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.state().fail_writes = true;
    mock.clear();

    sdr.close().unwrap();
    let events = mock.events();
    assert!(events.contains(&Event::write(0x3000, 0x0210, &[0x20])));
    assert!(mock.tuner_calls().contains(&TunerCall::Exit));
    assert_eq!(events.last(), Some(&Event::Release));
}

#[test]
fn test_drop_closes_once() {
    let mock = Mock::new();
    {
        let _sdr = mock.open(DeviceConfig::default()).unwrap();
    }
    let releases = mock
        .events()
        .iter()
        .filter(|e| **e == Event::Release)
        .count();
    assert_eq!(releases, 1);
}

#[test]
fn test_gpio_out_of_range_is_rejected_without_hardware_access() {
    let mock = Mock::new();
    let sdr = mock.open(DeviceConfig::default()).unwrap();
    mock.clear();

    assert!(matches!(sdr.bus().set_gpio_bit(8, true), Err(Error::InvalidParam(_))));
    assert!(matches!(sdr.bus().set_gpio_output(16), Err(Error::InvalidParam(_))));
    assert!(mock.events().is_empty());
}
