// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software model of the host-DMA bus, coupling a real CPU-side sequencer
//! to a real DSP-side sequencer so the full link can run end to end on the
//! host.
//!
//! The model is register-accurate where the sequencers care: descriptor
//! acceptance (`ALLOW_CNFG`/`DMA_RDY`), per-block FIFO movement with
//! `DMA_CMPLT` pacing, handshake (`HSHK`) set/auto-clear, the header
//! regions, latched interrupts toward the DSP, and the `BTE` back channel
//! in both directions. Faults are injected by failing the n-th block in
//! either direction.

// Each test binary compiles its own copy and uses a different subset.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use drv_am18x_emifa::{EmifaPort, EmifaSequencer};
use drv_bf52x_hostdp::{DmaIrq, HostControl, HostdpPort, HostdpSequencer};
use drv_hostdp_link::LinkDriver;
use drv_hostdp_link_api::{
    Header, HostStatus, LinkRam, DSP_TO_HOST_HEADER_BASE, HEADER_WIRE_WORDS,
};

/// End of the DSP header regions; below this, write/read descriptors hit
/// the header storage instead of DSP memory.
const HEADER_REGION_END: u32 = DSP_TO_HOST_HEADER_BASE + 2 * HEADER_WIRE_WORDS as u32;

/// Link-visible memory built from leaked regions, shared by handles.
///
/// `source` hands out `'static` slices into the leaked storage; tests must
/// not overlap a region being deposited into with one being served as a
/// response source.
#[derive(Clone, Default)]
pub struct TestRam {
    regions: Rc<RefCell<Vec<Region>>>,
}

struct Region {
    base: u32,
    ptr: *mut u32,
    len: usize,
}

impl TestRam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&self, base: u32, words: usize) {
        let ptr = Box::leak(vec![0u32; words].into_boxed_slice()).as_mut_ptr();
        self.regions.borrow_mut().push(Region { base, ptr, len: words });
    }

    fn locate(&self, addr: u32, count: usize) -> Option<*mut u32> {
        for r in self.regions.borrow().iter() {
            if addr >= r.base && addr % 4 == 0 {
                let off = ((addr - r.base) / 4) as usize;
                if off + count <= r.len {
                    return Some(unsafe { r.ptr.add(off) });
                }
            }
        }
        None
    }

    pub fn write(&self, addr: u32, data: &[u32]) {
        let p = self.locate(addr, data.len()).expect("address not mapped");
        for (i, &w) in data.iter().enumerate() {
            unsafe { p.add(i).write(w) };
        }
    }

    pub fn read(&self, addr: u32, count: usize) -> Vec<u32> {
        let p = self.locate(addr, count).expect("address not mapped");
        (0..count).map(|i| unsafe { p.add(i).read() }).collect()
    }
}

impl LinkRam for TestRam {
    fn source(&self, addr: u32, count: usize) -> Option<&'static [u32]> {
        let p = self.locate(addr, count)?;
        Some(unsafe { std::slice::from_raw_parts(p, count) })
    }

    fn deposit(&mut self, addr: u32, word: u32) {
        if let Some(p) = self.locate(addr, 1) {
            unsafe { p.write(word) };
        }
    }
}

/// A descriptor the CPU loaded, while its block transfer is in progress.
struct ActiveDma {
    write: bool,
    addr: u32,
    xcount: u16,
    moved: u16,
}

pub struct BusState {
    /// Bits shared by both views: ALLOW_CNFG, DMA_RDY, DMA_CMPLT, HSHK,
    /// FIFO levels.
    shared: HostStatus,
    /// Set once the DSP has configured its port; before that the status
    /// reads FIFO-full and FIFO-empty at once.
    link_configured: bool,

    fifo: VecDeque<u16>,
    cfg_partial: Vec<u16>,
    dma: Option<ActiveDma>,

    /// Header storage.
    host_to_dsp_header: [u16; HEADER_WIRE_WORDS],

    /// DSP-staged outbound transfer.
    dsp_out_header: Option<Header>,
    dsp_out_payload: Vec<u32>,

    dsp_control: HostControl,
    dsp_irqs_enabled: bool,

    /// Latched interrupts toward the DSP.
    dsp_dma1: Option<DmaIrq>,
    dsp_hostrd: Option<bool>, // true = HOSTRD_DONE set, false = fault
    dsp_status_irq: bool,

    /// Latched status interrupt toward the CPU.
    cpu_status_irq: bool,

    /// CPU-side back-channel flag.
    cpu_bte: bool,

    dsp_ram: TestRam,

    /// Fault injection: fail the n-th write block moved / read block
    /// drained (1-based, headers count).
    fail_write_block: Option<u32>,
    write_blocks_moved: u32,
    fail_read_block: Option<u32>,
    read_blocks_drained: u32,

    /// `(xcount, dsp burst mode)` for every write block moved.
    pub write_block_log: Vec<(u16, bool)>,
    /// `(xcount, dsp burst mode)` for every read block drained.
    pub read_block_log: Vec<(u16, bool)>,
}

impl BusState {
    fn new(dsp_ram: TestRam) -> Self {
        Self {
            shared: HostStatus::empty(),
            link_configured: false,
            fifo: VecDeque::new(),
            cfg_partial: Vec::new(),
            dma: None,
            host_to_dsp_header: [0; HEADER_WIRE_WORDS],
            dsp_out_header: None,
            dsp_out_payload: Vec::new(),
            dsp_control: HostControl::empty(),
            dsp_irqs_enabled: false,
            dsp_dma1: None,
            dsp_hostrd: None,
            dsp_status_irq: false,
            cpu_status_irq: false,
            cpu_bte: false,
            dsp_ram,
            fail_write_block: None,
            write_blocks_moved: 0,
            fail_read_block: None,
            read_blocks_drained: 0,
            write_block_log: Vec::new(),
            read_block_log: Vec::new(),
        }
    }

    fn idle_baseline(&mut self) {
        self.shared = HostStatus::ALLOW_CNFG | HostStatus::DMA_CMPLT | HostStatus::FIFO_EMPTY;
    }

    /// A write descriptor's block is fully in the FIFO: move it into the
    /// DSP end and raise the DMA interrupt.
    fn complete_write_block(&mut self) {
        let dma = self.dma.take().unwrap();
        self.write_blocks_moved += 1;
        self.write_block_log
            .push((dma.xcount, self.dsp_control.contains(HostControl::BDR)));

        let failed = self.fail_write_block == Some(self.write_blocks_moved);
        if !failed {
            if dma.addr < HEADER_REGION_END {
                let off = (dma.addr / 2) as usize;
                for i in 0..dma.xcount as usize {
                    self.host_to_dsp_header[off + i] =
                        self.fifo.pop_front().unwrap_or(0);
                }
            } else {
                let mut i = 0;
                while i < dma.xcount as u32 {
                    let lo = self.fifo.pop_front().unwrap_or(0) as u32;
                    let hi = self.fifo.pop_front().unwrap_or(0) as u32;
                    self.dsp_ram.deposit(dma.addr + 2 * i, lo | hi << 16);
                    i += 2;
                }
            }
        }
        self.fifo.clear();
        self.shared -= HostStatus::DMA_RDY;
        self.shared |= HostStatus::FIFO_EMPTY;

        self.dsp_dma1 = Some(if failed {
            DmaIrq::DMA_ERR
        } else {
            DmaIrq::DMA_DONE
        });
        // DMA_CMPLT rises when the DSP's handler acknowledges the block.
    }

    /// The CPU drained a read descriptor's block out of the FIFO.
    fn complete_read_drain(&mut self, dma: ActiveDma) {
        self.read_blocks_drained += 1;
        self.read_block_log
            .push((dma.xcount, self.dsp_control.contains(HostControl::BDR)));

        if dma.addr == DSP_TO_HOST_HEADER_BASE {
            // Hardware drops the handshake with the last header word.
            self.shared -= HostStatus::HSHK;
        }
        self.shared -= HostStatus::DMA_RDY;
        self.shared |= HostStatus::FIFO_EMPTY;

        let failed = self.fail_read_block == Some(self.read_blocks_drained);
        self.dsp_hostrd = Some(!failed);
    }

    /// Serves a read descriptor: fill the FIFO from the staged outbound
    /// transfer (header region or payload, by address).
    fn serve_read(&mut self, addr: u32, xcount: u16) {
        self.fifo.clear();
        if addr == DSP_TO_HOST_HEADER_BASE {
            let header = self.dsp_out_header.expect("read with nothing staged");
            for w in header.to_wire() {
                self.fifo.push_back(w);
            }
        } else {
            let base = self.dsp_out_header.map_or(0, |h| h.local_addr);
            let off16 = addr.wrapping_sub(base) / 2;
            for i in 0..xcount as u32 {
                let idx16 = (off16 + i) as usize;
                let word = self.dsp_out_payload.get(idx16 / 2).copied().unwrap_or(0);
                let half = if idx16 % 2 == 0 { word } else { word >> 16 };
                self.fifo.push_back(half as u16);
            }
        }
        self.shared -= HostStatus::FIFO_EMPTY;
        self.shared |= HostStatus::DMA_RDY;
        self.shared -= HostStatus::DMA_CMPLT;
    }
}

pub type Bus = Rc<RefCell<BusState>>;

/// The CPU's window onto the bus: the two 16-bit EMIFA-mapped ports.
pub struct CpuPort {
    bus: Bus,
}

impl EmifaPort for CpuPort {
    fn status(&self) -> HostStatus {
        let bus = self.bus.borrow();
        if !bus.link_configured {
            // Unconfigured host port: impossible FIFO state.
            return HostStatus::FIFO_FULL | HostStatus::FIFO_EMPTY;
        }
        let mut s = bus.shared;
        if bus.dsp_control.contains(HostControl::BT_EN) {
            s |= HostStatus::BTE;
        }
        s
    }

    fn write_config(&mut self, word: u16) {
        let mut bus = self.bus.borrow_mut();
        bus.cfg_partial.push(word);
        bus.shared -= HostStatus::ALLOW_CNFG;
        if bus.cfg_partial.len() < 7 {
            return;
        }
        let cfg: Vec<u16> = bus.cfg_partial.drain(..).collect();
        bus.shared |= HostStatus::ALLOW_CNFG;

        let write = cfg[0] & (1 << 1) != 0;
        let addr = cfg[1] as u32 | (cfg[2] as u32) << 16;
        let xcount = cfg[3];
        bus.dma = Some(ActiveDma {
            write,
            addr,
            xcount,
            moved: 0,
        });
        if write {
            bus.shared |= HostStatus::DMA_RDY;
            bus.shared -= HostStatus::DMA_CMPLT;
        } else {
            bus.serve_read(addr, xcount);
        }
    }

    fn read_data(&mut self) -> u16 {
        let mut bus = self.bus.borrow_mut();
        let word = bus.fifo.pop_front().unwrap_or(0);
        let drained =
            bus.fifo.is_empty() && matches!(bus.dma.as_ref(), Some(d) if !d.write);
        if drained {
            let dma = bus.dma.take().unwrap();
            bus.complete_read_drain(dma);
        }
        word
    }

    fn write_data(&mut self, word: u16) {
        let mut bus = self.bus.borrow_mut();
        bus.fifo.push_back(word);
        bus.shared -= HostStatus::FIFO_EMPTY;
        let full = match bus.dma.as_mut() {
            Some(dma) if dma.write => {
                dma.moved += 1;
                dma.moved == dma.xcount
            }
            _ => false,
        };
        if full {
            bus.complete_write_block();
        }
    }

    fn send_host_irq(&mut self) {
        self.bus.borrow_mut().dsp_status_irq = true;
    }

    fn set_bte(&mut self, on: bool) {
        let mut bus = self.bus.borrow_mut();
        bus.cpu_bte = on;
        if on {
            // The peer observes our back channel as a status interrupt.
            bus.dsp_status_irq = true;
        }
    }
}

/// The DSP's window onto the bus: its host-port register bank.
pub struct DspPort {
    bus: Bus,
}

impl HostdpPort for DspPort {
    fn status(&self) -> HostStatus {
        let bus = self.bus.borrow();
        let mut s = bus.shared;
        if bus.dsp_hostrd == Some(true) {
            s |= HostStatus::HOSTRD_DONE;
        }
        if bus.cpu_bte {
            s |= HostStatus::BTE;
        }
        s
    }

    fn raise_handshake(&mut self) {
        self.bus.borrow_mut().shared |= HostStatus::HSHK;
    }

    fn clear_handshake(&mut self) {
        self.bus.borrow_mut().shared -= HostStatus::HSHK;
    }

    fn ack_host_irq(&mut self) {}

    fn ack_write_block(&mut self) {
        let mut bus = self.bus.borrow_mut();
        bus.dsp_dma1 = None;
        bus.shared |= HostStatus::DMA_CMPLT;
    }

    fn ack_read_block(&mut self) {
        let mut bus = self.bus.borrow_mut();
        bus.dsp_hostrd = None;
        bus.shared |= HostStatus::DMA_CMPLT;
    }

    fn dma_irq(&self) -> DmaIrq {
        self.bus.borrow().dsp_dma1.unwrap_or(DmaIrq::empty())
    }

    fn ack_dma_error(&mut self) {
        self.bus.borrow_mut().dsp_dma1 = None;
    }

    fn write_control(&mut self, control: HostControl) {
        let mut bus = self.bus.borrow_mut();
        let was_bte = bus.dsp_control.contains(HostControl::BT_EN);
        bus.dsp_control = control;
        if !bus.link_configured && control.contains(HostControl::HOSTDP_EN) {
            bus.link_configured = true;
            bus.idle_baseline();
        }
        if !was_bte && control.contains(HostControl::BT_EN) {
            bus.cpu_status_irq = true;
        }
    }

    fn enable_dma_irqs(&mut self) {
        self.bus.borrow_mut().dsp_irqs_enabled = true;
    }

    fn disable_dma_irqs(&mut self) {
        self.bus.borrow_mut().dsp_irqs_enabled = false;
    }

    fn reset_port(&mut self) {
        let mut bus = self.bus.borrow_mut();
        bus.fifo.clear();
        bus.cfg_partial.clear();
        bus.dma = None;
        bus.dsp_dma1 = None;
        bus.dsp_hostrd = None;
        bus.idle_baseline();
    }

    fn signal_peer_restart(&mut self) {
        self.bus.borrow_mut().cpu_status_irq = true;
    }

    fn read_header(&self) -> Header {
        Header::from_wire(self.bus.borrow().host_to_dsp_header)
    }

    fn stage_outbound(&mut self, header: &Header, payload: Option<&'static [u32]>) {
        let mut bus = self.bus.borrow_mut();
        bus.dsp_out_header = Some(*header);
        bus.dsp_out_payload = payload.map_or(Vec::new(), |p| p.to_vec());
    }
}

pub type CpuDriver = LinkDriver<EmifaSequencer<CpuPort, TestRam>, TestRam>;
pub type DspDriver = LinkDriver<HostdpSequencer<DspPort>, TestRam>;

/// Both sides of the link plus their memories, wired through one bus.
pub struct Rig {
    pub bus: Bus,
    pub cpu: CpuDriver,
    pub dsp: DspDriver,
    pub cpu_ram: TestRam,
    pub dsp_ram: TestRam,
}

/// Default test memory windows.
pub const CPU_RAM_BASE: u32 = 0xC000_0000;
pub const DSP_RAM_BASE: u32 = 0x0000_1000;
pub const RAM_WORDS: usize = 0x10000;

impl Rig {
    pub fn new() -> Self {
        let cpu_ram = TestRam::new();
        cpu_ram.add_region(CPU_RAM_BASE, RAM_WORDS);
        let dsp_ram = TestRam::new();
        dsp_ram.add_region(DSP_RAM_BASE, RAM_WORDS);

        let bus: Bus = Rc::new(RefCell::new(BusState::new(dsp_ram.clone())));

        let mut dsp = LinkDriver::new(
            HostdpSequencer::new(DspPort { bus: Rc::clone(&bus) }),
            dsp_ram.clone(),
        );
        dsp.init(None);

        let mut cpu = LinkDriver::new(
            EmifaSequencer::new(CpuPort { bus: Rc::clone(&bus) }, cpu_ram.clone()),
            cpu_ram.clone(),
        );
        cpu.init(None);

        Self {
            bus,
            cpu,
            dsp,
            cpu_ram,
            dsp_ram,
        }
    }

    /// Delivers pending interrupts, then ticks both drivers, `n` times.
    /// Each iteration moves at most one block in each direction, so `n`
    /// bounds the amount of bus work.
    ///
    /// Interrupts drain in occurrence order: a pending host-read-done
    /// always predates a pending DMA-done (the CPU can only have started
    /// the next transfer after draining the previous one), so it is
    /// delivered first. The DSP ticks before the CPU so a response it
    /// stages is visible (as a raised handshake) before the CPU's next
    /// launch checks the bus.
    pub fn pump_n(&mut self, n: usize) {
        for _ in 0..n {
            loop {
                let (status_irq, dma1, hostrd, enabled) = {
                    let bus = self.bus.borrow();
                    (
                        bus.dsp_status_irq,
                        bus.dsp_dma1.is_some(),
                        bus.dsp_hostrd.is_some(),
                        bus.dsp_irqs_enabled,
                    )
                };
                if status_irq {
                    self.bus.borrow_mut().dsp_status_irq = false;
                    self.dsp.sequencer_mut().on_status_irq();
                } else if hostrd && enabled {
                    self.dsp.sequencer_mut().on_host_read_done_irq();
                } else if dma1 && enabled {
                    self.dsp.sequencer_mut().on_dma_irq();
                } else {
                    break;
                }
            }

            if self.bus.borrow().cpu_status_irq {
                self.bus.borrow_mut().cpu_status_irq = false;
                self.cpu.sequencer_mut().on_status_irq();
            }

            self.dsp.tick();
            self.cpu.tick();
        }
    }

    /// Enough pumping for the small transfers most tests use.
    pub fn pump(&mut self) {
        self.pump_n(64);
    }

    pub fn fail_write_block(&self, n: u32) {
        self.bus.borrow_mut().fail_write_block = Some(n);
    }

    pub fn fail_read_block(&self, n: u32) {
        self.bus.borrow_mut().fail_read_block = Some(n);
    }
}
