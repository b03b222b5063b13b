use std::io::{Read, Result};

use log::debug;

use super::{
    build_unit_tables, Arena, RangeDecoderH, See, SeeSource, K_EXP_ESCAPE, K_INIT_BIN_ESC,
    MAX_FREQ, NUM_INDEXES, PERIOD_BITS, UNIT_SIZE,
};

/// Escape below the order-0 root: no legitimate meaning in these streams.
pub(crate) const SYM_END: i32 = -1;
/// The arithmetic code left the valid frequency interval.
pub(crate) const SYM_ERROR: i32 = -2;

pub(crate) const ORDER_MIN: u32 = 2;
pub(crate) const ORDER_MAX: u32 = 64;
pub(crate) const MEM_MIN: u32 = 1 << 11;
pub(crate) const MEM_MAX: u32 = u32::MAX - 12 * 3;

/// PPMd variant H model state.
///
/// Contexts are 12 bytes: `num_stats` (u16, true symbol count),
/// `summ_freq`/one-state (u16), stats-block reference (u32), suffix
/// reference (u32). The record pool grows from both ends of the arena;
/// raw text (pending successor positions) grows from the bottom.
#[derive(Debug)]
pub(crate) struct ModelH {
    mem: Arena,
    min_context: u32,
    max_context: u32,
    found_state: u32,
    order_fall: u32,
    init_esc: u32,
    prev_success: u32,
    max_order: u32,
    hi_bits_flag: u32,
    run_length: i32,
    init_rl: i32,
    size: u32,
    glue_count: u32,
    lo_unit: u32,
    hi_unit: u32,
    text: u32,
    units_start: u32,
    index2units: [u8; 40],
    units2index: [u8; 128],
    free_list: [u32; NUM_INDEXES],
    ns2bs_index: [u8; 256],
    ns2index: [u8; 256],
    dummy_see: See,
    see: [[See; 16]; 25],
    bin_summ: [[u16; 64]; 128],
}

impl ModelH {
    pub fn new(max_order: u32, mem_size: u32) -> crate::Result<Self> {
        let (index2units, units2index) = build_unit_tables();

        let mut ns2bs_index = [0u8; 256];
        ns2bs_index[0] = 0;
        ns2bs_index[1] = 2;
        ns2bs_index[2..11].fill(4);
        ns2bs_index[11..256].fill(6);

        let mut ns2index = [0u8; 256];
        for (i, v) in ns2index.iter_mut().enumerate().take(3) {
            *v = i as u8;
        }
        let mut m = 3u32;
        let mut k = 1u32;
        for i in 3..256 {
            ns2index[i] = m as u8;
            k -= 1;
            if k == 0 {
                m += 1;
                k = m - 2;
            }
        }

        let mut model = Self {
            mem: Arena::new(mem_size)?,
            min_context: 0,
            max_context: 0,
            found_state: 0,
            order_fall: 0,
            init_esc: 0,
            prev_success: 0,
            max_order,
            hi_bits_flag: 0,
            run_length: 0,
            init_rl: 0,
            size: mem_size,
            glue_count: 0,
            lo_unit: 0,
            hi_unit: 0,
            text: 0,
            units_start: 0,
            index2units,
            units2index,
            free_list: [0; NUM_INDEXES],
            ns2bs_index,
            ns2index,
            dummy_see: See::default(),
            see: [[See::default(); 16]; 25],
            bin_summ: [[0; 64]; 128],
        };
        model.restart_model();
        Ok(model)
    }

    // Context field views.

    #[inline]
    fn num_stats(&self, c: u32) -> u32 {
        self.mem.u16(c) as u32
    }

    #[inline]
    fn set_num_stats(&mut self, c: u32, v: u32) {
        self.mem.set_u16(c, v as u16);
    }

    #[inline]
    fn summ_freq(&self, c: u32) -> u32 {
        self.mem.u16(c + 2) as u32
    }

    #[inline]
    fn set_summ_freq(&mut self, c: u32, v: u32) {
        self.mem.set_u16(c + 2, v as u16);
    }

    #[inline]
    fn stats(&self, c: u32) -> u32 {
        self.mem.u32(c + 4)
    }

    #[inline]
    fn set_stats(&mut self, c: u32, v: u32) {
        self.mem.set_u32(c + 4, v);
    }

    #[inline]
    fn suffix(&self, c: u32) -> u32 {
        self.mem.u32(c + 8)
    }

    #[inline]
    fn set_suffix(&mut self, c: u32, v: u32) {
        self.mem.set_u32(c + 8, v);
    }

    /// The single state of a binary context overlays bytes 2..8.
    #[inline]
    fn one_state(c: u32) -> u32 {
        c + 2
    }

    // Free-list management. A free node stores the next-free link in its
    // first four bytes; during a glue pass the same bytes become a
    // `stamp u16 / nu u16` pair with the list link at offset 4.

    fn insert_node(&mut self, node: u32, index: u32) {
        self.mem.set_u32(node, self.free_list[index as usize]);
        self.free_list[index as usize] = node;
    }

    fn remove_node(&mut self, index: u32) -> u32 {
        let node = self.free_list[index as usize];
        self.free_list[index as usize] = self.mem.u32(node);
        node
    }

    fn split_block(&mut self, mut ptr: u32, old_index: u32, new_index: u32) {
        let nu =
            self.index2units[old_index as usize] as u32 - self.index2units[new_index as usize] as u32;
        ptr += self.index2units[new_index as usize] as u32 * UNIT_SIZE;
        let mut i = self.units2index[nu as usize - 1] as u32;
        if self.index2units[i as usize] as u32 != nu {
            i -= 1;
            let k = self.index2units[i as usize] as u32;
            self.insert_node(ptr + k * UNIT_SIZE, nu - k - 1);
        }
        self.insert_node(ptr, i);
    }

    fn glue_free_blocks(&mut self) {
        let mut n = 0u32;
        self.glue_count = 255;

        // Guard record above the free area: stamp 1 is never a free node.
        if self.lo_unit != self.hi_unit {
            self.mem.set_u16(self.lo_unit, 1);
        }

        for i in 0..NUM_INDEXES {
            let nu = self.index2units[i] as u16;
            let mut next = self.free_list[i];
            self.free_list[i] = 0;
            while next != 0 {
                let node = next;
                next = self.mem.u32(node);
                self.mem.set_u16(node, 0);
                self.mem.set_u16(node + 2, nu);
                self.mem.set_u32(node + 4, n);
                n = node;
            }
        }

        self.glue_blocks(n);
        self.fill_list(n);
    }

    /// Merges physically adjacent free blocks in the collected list.
    fn glue_blocks(&mut self, mut n: u32) {
        while n != 0 {
            let node = n;
            let mut nu = self.mem.u16(node + 2) as u32;
            n = self.mem.u32(node + 4);
            if nu == 0 {
                continue;
            }
            loop {
                let node2 = node + nu * UNIT_SIZE;
                nu += self.mem.u16(node2 + 2) as u32;
                if self.mem.u16(node2) != 0 || nu >= 0x10000 {
                    break;
                }
                self.mem.set_u16(node + 2, nu as u16);
                self.mem.set_u16(node2 + 2, 0);
            }
        }
    }

    /// Redistributes the glued blocks back into the size-class lists.
    fn fill_list(&mut self, head: u32) {
        let mut n = head;
        while n != 0 {
            let mut node = n;
            let mut nu = self.mem.u16(node + 2) as u32;
            n = self.mem.u32(node + 4);
            if nu == 0 {
                continue;
            }
            while nu > 128 {
                self.insert_node(node, NUM_INDEXES as u32 - 1);
                nu -= 128;
                node += 128 * UNIT_SIZE;
            }
            let mut index = self.units2index[nu as usize - 1] as u32;
            if self.index2units[index as usize] as u32 != nu {
                index -= 1;
                let k = self.index2units[index as usize] as u32;
                self.insert_node(node + k * UNIT_SIZE, nu - k - 1);
            }
            self.insert_node(node, index);
        }
    }

    fn alloc_units_rare(&mut self, index: u32) -> Option<u32> {
        if self.glue_count == 0 {
            self.glue_free_blocks();
            if self.free_list[index as usize] != 0 {
                return Some(self.remove_node(index));
            }
        }
        let mut i = index;
        loop {
            i += 1;
            if i == NUM_INDEXES as u32 {
                let num_bytes = self.index2units[index as usize] as u32 * UNIT_SIZE;
                self.glue_count -= 1;
                return if self.units_start - self.text > num_bytes {
                    self.units_start -= num_bytes;
                    Some(self.units_start)
                } else {
                    None
                };
            }
            if self.free_list[i as usize] != 0 {
                break;
            }
        }
        let block = self.remove_node(i);
        self.split_block(block, i, index);
        Some(block)
    }

    fn alloc_units(&mut self, index: u32) -> Option<u32> {
        if self.free_list[index as usize] != 0 {
            return Some(self.remove_node(index));
        }
        let num_bytes = self.index2units[index as usize] as u32 * UNIT_SIZE;
        if self.hi_unit - self.lo_unit >= num_bytes {
            let lo = self.lo_unit;
            self.lo_unit += num_bytes;
            return Some(lo);
        }
        self.alloc_units_rare(index)
    }

    fn restart_model(&mut self) {
        self.free_list = [0; NUM_INDEXES];

        self.text = self.mem.start();
        self.hi_unit = self.text + self.size;
        self.units_start = self.hi_unit - self.size / 8 / UNIT_SIZE * 7 * UNIT_SIZE;
        self.lo_unit = self.units_start;
        self.glue_count = 0;

        self.order_fall = self.max_order;
        self.init_rl = -(self.max_order.min(12) as i32) - 1;
        self.run_length = self.init_rl;
        self.prev_success = 0;

        self.hi_unit -= UNIT_SIZE;
        let mc = self.hi_unit;
        let s = self.lo_unit;
        self.lo_unit += (256 / 2) * UNIT_SIZE;
        self.min_context = mc;
        self.max_context = mc;
        self.found_state = s;

        self.set_num_stats(mc, 256);
        self.set_summ_freq(mc, 256 + 1);
        self.set_stats(mc, s);
        self.set_suffix(mc, 0);

        for i in 0..256u32 {
            let st = s + i * 6;
            self.mem.set_sym(st, i as u8);
            self.mem.set_freq(st, 1);
            self.mem.set_successor(st, 0);
        }

        for i in 0..128usize {
            for k in 0..8usize {
                let val = (super::BIN_SCALE - K_INIT_BIN_ESC[k] as u32 / (i as u32 + 2)) as u16;
                for m in (0..64).step_by(8) {
                    self.bin_summ[i][k + m] = val;
                }
            }
        }

        for i in 0..25usize {
            let summ = ((5 * i as u32 + 10) << (PERIOD_BITS - 4)) as u16;
            for k in 0..16usize {
                self.see[i][k] = See {
                    summ,
                    shift: (PERIOD_BITS - 4) as u8,
                    count: 4,
                };
            }
        }
        self.dummy_see = See {
            summ: 0,
            shift: PERIOD_BITS as u8,
            count: 64,
        };
    }

    fn restart_after_exhaustion(&mut self) {
        debug!("ppmd-h: record pool exhausted, restarting model");
        self.restart_model();
    }

    /// Materializes context records for a chain of raw-text successors,
    /// from the lowest order upward. Returns the resulting context, or
    /// `None` when the record pool is exhausted.
    fn create_successors(&mut self) -> Option<u32> {
        let mut c = self.min_context;
        let mut up_branch = self.mem.successor(self.found_state);
        let mut ps = [0u32; ORDER_MAX as usize];
        let mut num_ps = 0usize;

        if self.order_fall != 0 {
            ps[num_ps] = self.found_state;
            num_ps += 1;
        }

        while self.suffix(c) != 0 {
            c = self.suffix(c);
            let s;
            if self.num_stats(c) != 1 {
                let sym = self.mem.sym(self.found_state);
                let mut t = self.stats(c);
                while self.mem.sym(t) != sym {
                    t += 6;
                }
                s = t;
            } else {
                s = Self::one_state(c);
            }
            let successor = self.mem.successor(s);
            if successor != up_branch {
                c = successor;
                if num_ps == 0 {
                    return Some(c);
                }
                break;
            }
            ps[num_ps] = s;
            num_ps += 1;
        }

        let new_sym = self.mem.u8(up_branch);
        up_branch += 1;

        let new_freq;
        if self.num_stats(c) == 1 {
            new_freq = self.mem.freq(Self::one_state(c));
        } else {
            let mut s = self.stats(c);
            while self.mem.sym(s) != new_sym {
                s += 6;
            }
            let cf = self.mem.freq(s) as u32 - 1;
            let s0 = self.summ_freq(c) - self.num_stats(c) - cf;
            new_freq = (1 + if 2 * cf <= s0 {
                (5 * cf > s0) as u32
            } else {
                (2 * cf + s0 - 1) / (2 * s0) + 1
            }) as u8;
        }

        loop {
            let c1 = if self.hi_unit != self.lo_unit {
                self.hi_unit -= UNIT_SIZE;
                self.hi_unit
            } else if self.free_list[0] != 0 {
                self.remove_node(0)
            } else {
                self.alloc_units_rare(0)?
            };
            self.set_num_stats(c1, 1);
            let one = Self::one_state(c1);
            self.mem.set_sym(one, new_sym);
            self.mem.set_freq(one, new_freq);
            self.mem.set_successor(one, up_branch);
            self.set_suffix(c1, c);
            num_ps -= 1;
            self.mem.set_successor(ps[num_ps], c1);
            c = c1;
            if num_ps == 0 {
                break;
            }
        }
        Some(c)
    }

    fn update_model(&mut self) {
        let f_freq = self.mem.freq(self.found_state) as u32;
        let f_symbol = self.mem.sym(self.found_state);
        let mc = self.min_context;

        if f_freq < (MAX_FREQ / 4) as u32 && self.suffix(mc) != 0 {
            // bump the symbol in the suffix context as well
            let c = self.suffix(mc);
            if self.num_stats(c) == 1 {
                let s = Self::one_state(c);
                let freq = self.mem.freq(s);
                if freq < 32 {
                    self.mem.set_freq(s, freq + 1);
                }
            } else {
                let mut s = self.stats(c);
                if self.mem.sym(s) != f_symbol {
                    while self.mem.sym(s) != f_symbol {
                        s += 6;
                    }
                    if self.mem.freq(s) >= self.mem.freq(s - 6) {
                        self.mem.swap_states(s, s - 6);
                        s -= 6;
                    }
                }
                let freq = self.mem.freq(s);
                if freq < MAX_FREQ - 9 {
                    self.mem.set_freq(s, freq + 2);
                    self.set_summ_freq(c, self.summ_freq(c) + 2);
                }
            }
        }

        if self.order_fall == 0 {
            match self.create_successors() {
                None => {
                    self.restart_after_exhaustion();
                    return;
                }
                Some(c) => {
                    self.min_context = c;
                    self.max_context = c;
                    self.mem.set_successor(self.found_state, c);
                }
            }
            return;
        }

        self.mem.set_u8(self.text, f_symbol);
        self.text += 1;
        if self.text >= self.units_start {
            self.restart_after_exhaustion();
            return;
        }
        let mut max_successor = self.text;

        let mut min_successor = self.mem.successor(self.found_state);
        if min_successor == 0 {
            // only the order-0 root carries null successors; repoint to raw text
            self.mem.set_successor(self.found_state, max_successor);
            min_successor = self.min_context;
        } else {
            if min_successor <= max_successor {
                // raw successor: materialize the context chain first
                match self.create_successors() {
                    None => {
                        self.restart_after_exhaustion();
                        return;
                    }
                    Some(c) => min_successor = c,
                }
            }
            self.order_fall -= 1;
            if self.order_fall == 0 {
                max_successor = min_successor;
                if self.max_context != self.min_context {
                    self.text -= 1;
                }
            }
        }

        let mc = self.min_context;
        let mut c = self.max_context;
        self.min_context = min_successor;
        self.max_context = min_successor;
        if c == mc {
            return;
        }

        let ns = self.num_stats(mc);
        let s0 = self.summ_freq(mc) - ns - (f_freq - 1);

        while c != mc {
            let mut sum;
            let ns1 = self.num_stats(c);
            if ns1 != 1 {
                if ns1 & 1 == 0 {
                    // stats block is full, grow it by one unit
                    let old_nu = ns1 >> 1;
                    let i = self.units2index[old_nu as usize - 1] as u32;
                    if i != self.units2index[old_nu as usize] as u32 {
                        let Some(ptr) = self.alloc_units(i + 1) else {
                            self.restart_after_exhaustion();
                            return;
                        };
                        let old_ptr = self.stats(c);
                        self.mem.copy_units(ptr, old_ptr, old_nu);
                        self.insert_node(old_ptr, i);
                        self.set_stats(c, ptr);
                    }
                }
                sum = self.summ_freq(c);
                sum += ((2 * ns1 < ns) as u32)
                    + 2 * ((4 * ns1 <= ns) as u32 & (sum <= 8 * ns1) as u32);
            } else {
                // grow the binary context into a two-symbol one
                let Some(s) = self.alloc_units(0) else {
                    self.restart_after_exhaustion();
                    return;
                };
                self.mem.copy_state(s, Self::one_state(c));
                self.set_stats(c, s);
                let mut freq = self.mem.freq(s) as u32;
                if freq < (MAX_FREQ / 4 - 1) as u32 {
                    freq <<= 1;
                } else {
                    freq = (MAX_FREQ - 4) as u32;
                }
                self.mem.set_freq(s, freq as u8);
                sum = freq + self.init_esc + ((ns > 3) as u32);
            }

            let s = self.stats(c) + ns1 * 6;
            let mut cf = 2 * (sum + 6) * f_freq;
            let sf = s0 + sum;
            self.mem.set_sym(s, f_symbol);
            self.set_num_stats(c, ns1 + 1);
            self.mem.set_successor(s, max_successor);
            if cf < 6 * sf {
                cf = 1 + ((cf > sf) as u32) + ((cf >= 4 * sf) as u32);
                sum += 3;
            } else {
                cf = 4
                    + ((cf >= 9 * sf) as u32)
                    + ((cf >= 12 * sf) as u32)
                    + ((cf >= 15 * sf) as u32);
                sum += cf;
            }
            self.set_summ_freq(c, sum);
            self.mem.set_freq(s, cf as u8);

            c = self.suffix(c);
        }
    }

    fn rescale(&mut self) {
        let stats = self.stats(self.min_context);
        let mut s = self.found_state;

        // move the found state to the front, then halve and re-sort
        if s != stats {
            let tmp = self.mem.state_bytes(s);
            while s != stats {
                self.mem.copy_state(s, s - 6);
                s -= 6;
            }
            self.mem.write_state_bytes(stats, tmp);
        }

        let mut sum_freq = self.mem.freq(s) as u32;
        let mut esc_freq = self.summ_freq(self.min_context) - sum_freq;

        // a non-zero order fall forbids dropping symbols from this context
        let adder = (self.order_fall != 0) as u32;

        sum_freq = (sum_freq + 4 + adder) >> 1;
        self.mem.set_freq(s, sum_freq as u8);

        for _ in 0..self.num_stats(self.min_context) - 1 {
            s += 6;
            let mut freq = self.mem.freq(s) as u32;
            esc_freq -= freq;
            freq = (freq + adder) >> 1;
            sum_freq += freq;
            self.mem.set_freq(s, freq as u8);
            if freq > self.mem.freq(s - 6) as u32 {
                let tmp = self.mem.state_bytes(s);
                let mut s1 = s;
                loop {
                    self.mem.copy_state(s1, s1 - 6);
                    s1 -= 6;
                    if s1 == stats || freq <= self.mem.freq(s1 - 6) as u32 {
                        break;
                    }
                }
                self.mem.write_state_bytes(s1, tmp);
            }
        }

        if self.mem.freq(s) == 0 {
            // drop the zero-frequency tail
            let mut i = 0u32;
            while self.mem.freq(s) == 0 {
                i += 1;
                s -= 6;
            }
            esc_freq += i;

            let mc = self.min_context;
            let num_stats = self.num_stats(mc);
            let num_stats_new = num_stats - i;
            self.set_num_stats(mc, num_stats_new);
            let n0 = (num_stats + 1) >> 1;

            if num_stats_new == 1 {
                let mut freq = self.mem.freq(stats) as u32;
                loop {
                    freq -= freq >> 1;
                    esc_freq >>= 1;
                    if esc_freq <= 1 {
                        break;
                    }
                }
                let one = Self::one_state(mc);
                self.mem.copy_state(one, stats);
                self.mem.set_freq(one, freq as u8);
                self.found_state = one;
                self.insert_node(stats, self.units2index[n0 as usize - 1] as u32);
                return;
            }

            let n1 = (num_stats_new + 1) >> 1;
            if n0 != n1 {
                let i0 = self.units2index[n0 as usize - 1] as u32;
                let i1 = self.units2index[n1 as usize - 1] as u32;
                if i0 != i1 {
                    if self.free_list[i1 as usize] != 0 {
                        let ptr = self.remove_node(i1);
                        self.set_stats(self.min_context, ptr);
                        self.mem.copy_units(ptr, stats, n1);
                        self.insert_node(stats, i0);
                    } else {
                        self.split_block(stats, i0, i1);
                    }
                }
            }
        }

        let mc = self.min_context;
        self.set_summ_freq(mc, sum_freq + esc_freq - (esc_freq >> 1));
        self.found_state = self.stats(mc);
    }

    fn make_esc_freq(&mut self, num_masked: u32, esc_freq: &mut u32) -> SeeSource {
        let mc = self.min_context;
        let num_stats = self.num_stats(mc);
        if num_stats != 256 {
            let non_masked = num_stats - num_masked;
            let row = self.ns2index[non_masked as usize - 1] as usize;
            let suffix_ns = self.num_stats(self.suffix(mc));
            let col = (non_masked < suffix_ns.wrapping_sub(num_stats)) as usize
                + 2 * ((self.summ_freq(mc) < 11 * num_stats) as usize)
                + 4 * ((num_masked > non_masked) as usize)
                + self.hi_bits_flag as usize;
            let see = &mut self.see[row][col];
            let summ = see.summ as u32;
            let r = summ >> see.shift;
            see.summ = (summ - r) as u16;
            *esc_freq = r + (r == 0) as u32;
            SeeSource::Table(row, col)
        } else {
            *esc_freq = 1;
            SeeSource::Dummy
        }
    }

    fn get_see_mut(&mut self, src: SeeSource) -> &mut See {
        match src {
            SeeSource::Dummy => &mut self.dummy_see,
            SeeSource::Table(i, k) => &mut self.see[i][k],
        }
    }

    fn next_context(&mut self) {
        let successor = self.mem.successor(self.found_state);
        if self.order_fall == 0 && successor > self.text {
            self.min_context = successor;
            self.max_context = successor;
        } else {
            self.update_model();
        }
    }

    fn update1(&mut self) {
        let mut s = self.found_state;
        let freq = self.mem.freq(s) as u32 + 4;
        self.set_summ_freq(self.min_context, self.summ_freq(self.min_context) + 4);
        self.mem.set_freq(s, freq as u8);
        if freq > self.mem.freq(s - 6) as u32 {
            self.mem.swap_states(s, s - 6);
            s -= 6;
            self.found_state = s;
            if freq > MAX_FREQ as u32 {
                self.rescale();
            }
        }
        self.next_context();
    }

    fn update1_0(&mut self) {
        let s = self.found_state;
        let mc = self.min_context;
        let mut freq = self.mem.freq(s) as u32;
        let summ_freq = self.summ_freq(mc);
        self.prev_success = (2 * freq > summ_freq) as u32;
        self.run_length += self.prev_success as i32;
        self.set_summ_freq(mc, summ_freq + 4);
        freq += 4;
        self.mem.set_freq(s, freq as u8);
        if freq > MAX_FREQ as u32 {
            self.rescale();
        }
        self.next_context();
    }

    fn update_bin(&mut self, s: u32) {
        let freq = self.mem.freq(s);
        self.found_state = s;
        self.prev_success = 1;
        self.run_length += 1;
        if freq < 128 {
            self.mem.set_freq(s, freq + 1);
        }
        self.next_context();
    }

    fn update2(&mut self) {
        let s = self.found_state;
        let freq = self.mem.freq(s) as u32 + 4;
        self.run_length = self.init_rl;
        self.set_summ_freq(self.min_context, self.summ_freq(self.min_context) + 4);
        self.mem.set_freq(s, freq as u8);
        if freq > MAX_FREQ as u32 {
            self.rescale();
        }
        self.update_model();
    }

    fn hi_bits_flag3(symbol: u32) -> u32 {
        (symbol + 0xC0) >> (8 - 3) & (1 << 3)
    }

    fn hi_bits_flag4(symbol: u32) -> u32 {
        (symbol + 0xC0) >> (8 - 4) & (1 << 4)
    }

    fn bin_summ_index(&mut self) -> (usize, usize) {
        let mc = self.min_context;
        let one = Self::one_state(mc);
        let flag3 = Self::hi_bits_flag3(self.mem.sym(self.found_state) as u32);
        self.hi_bits_flag = flag3;
        let flag4 = Self::hi_bits_flag4(self.mem.sym(one) as u32);
        let suffix_ns = self.num_stats(self.suffix(mc)) as usize;
        let col = self.prev_success
            + ((self.run_length as u32 >> 26) & 0x20)
            + self.ns2bs_index[suffix_ns - 1] as u32
            + flag4
            + flag3;
        (self.mem.freq(one) as usize - 1, col as usize)
    }

    fn mask_context_symbols(&self, char_mask: &mut [u8; 256], c: u32) {
        let stats = self.stats(c);
        for i in 0..self.num_stats(c) {
            char_mask[self.mem.sym(stats + i * 6) as usize] = 0;
        }
    }

    pub fn decode_symbol<R: Read>(&mut self, rc: &mut RangeDecoderH<R>) -> Result<i32> {
        let mut char_mask = [0u8; 256];
        let mc = self.min_context;

        if self.num_stats(mc) != 1 {
            let mut s = self.stats(mc);
            let summ_freq = self.summ_freq(mc);
            let count = rc.threshold(summ_freq);
            let mut hi_cnt = self.mem.freq(s) as u32;
            if count < hi_cnt {
                rc.decode(0, hi_cnt)?;
                self.found_state = s;
                let sym = self.mem.sym(s);
                self.update1_0();
                return Ok(sym as i32);
            }
            self.prev_success = 0;
            let mut found = false;
            for _ in 1..self.num_stats(mc) {
                s += 6;
                let f = self.mem.freq(s) as u32;
                hi_cnt += f;
                if hi_cnt > count {
                    rc.decode(hi_cnt - f, f)?;
                    found = true;
                    break;
                }
            }
            if found {
                self.found_state = s;
                let sym = self.mem.sym(s);
                self.update1();
                return Ok(sym as i32);
            }
            if count >= summ_freq {
                return Ok(SYM_ERROR);
            }
            self.hi_bits_flag = Self::hi_bits_flag3(self.mem.sym(self.found_state) as u32);
            rc.decode(hi_cnt, summ_freq - hi_cnt)?;
            char_mask = [0xFF; 256];
            self.mask_context_symbols(&mut char_mask, mc);
        } else {
            let (row, col) = self.bin_summ_index();
            let pr = self.bin_summ[row][col] as u32;
            let mean = (pr + (1 << (PERIOD_BITS - 2))) >> PERIOD_BITS;
            let size0 = (rc.range >> 14) * pr;
            if rc.decode_bin(size0)? {
                self.bin_summ[row][col] = (pr + (1 << 7) - mean) as u16;
                let one = Self::one_state(mc);
                let sym = self.mem.sym(one);
                self.update_bin(one);
                return Ok(sym as i32);
            }
            let pr = pr - mean;
            self.bin_summ[row][col] = pr as u16;
            self.init_esc = K_EXP_ESCAPE[(pr >> 10) as usize] as u32;
            char_mask = [0xFF; 256];
            char_mask[self.mem.sym(Self::one_state(mc)) as usize] = 0;
            self.prev_success = 0;
        }

        loop {
            rc.normalize()?;
            let num_masked = self.num_stats(self.min_context);
            loop {
                self.order_fall += 1;
                let suffix = self.suffix(self.min_context);
                if suffix == 0 {
                    return Ok(SYM_END);
                }
                self.min_context = suffix;
                if self.num_stats(self.min_context) != num_masked {
                    break;
                }
            }

            let mc = self.min_context;
            let ns = self.num_stats(mc);
            let stats = self.stats(mc);
            let mut hi_cnt = 0u32;
            for i in 0..ns {
                let st = stats + i * 6;
                hi_cnt +=
                    (self.mem.freq(st) & char_mask[self.mem.sym(st) as usize]) as u32;
            }

            let mut esc_freq = 0u32;
            let see_src = self.make_esc_freq(num_masked, &mut esc_freq);
            let freq_sum = esc_freq + hi_cnt;
            let count = rc.threshold(freq_sum);

            if count < hi_cnt {
                let mut acc = 0u32;
                let mut s = stats;
                loop {
                    let f = (self.mem.freq(s) & char_mask[self.mem.sym(s) as usize]) as u32;
                    if count < acc + f {
                        break;
                    }
                    acc += f;
                    s += 6;
                }
                rc.decode(acc, self.mem.freq(s) as u32)?;
                self.get_see_mut(see_src).update();
                self.found_state = s;
                let sym = self.mem.sym(s);
                self.update2();
                return Ok(sym as i32);
            }
            if count >= freq_sum {
                return Ok(SYM_ERROR);
            }
            rc.decode(hi_cnt, freq_sum - hi_cnt)?;
            let see = self.get_see_mut(see_src);
            see.summ = see.summ.wrapping_add(freq_sum as u16);
            self.mask_context_symbols(&mut char_mask, mc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_builds_root_context() {
        let model = ModelH::new(6, 1 << 16).unwrap();
        let root = model.min_context;
        assert_eq!(model.num_stats(root), 256);
        assert_eq!(model.summ_freq(root), 257);
        assert_eq!(model.suffix(root), 0);
        let stats = model.stats(root);
        for i in 0..256u32 {
            assert_eq!(model.mem.sym(stats + i * 6), i as u8);
            assert_eq!(model.mem.freq(stats + i * 6), 1);
            assert_eq!(model.mem.successor(stats + i * 6), 0);
        }
        assert_eq!(model.order_fall, 6);
        assert_eq!(model.init_rl, -7);
    }

    #[test]
    fn bin_summ_seeded_from_escape_table() {
        let model = ModelH::new(4, 1 << 16).unwrap();
        for k in 0..8usize {
            let expect = (super::super::BIN_SCALE - K_INIT_BIN_ESC[k] as u32 / 2) as u16;
            assert_eq!(model.bin_summ[0][k], expect);
            assert_eq!(model.bin_summ[0][k + 8], expect);
        }
    }

    #[test]
    fn allocator_round_trips_units() {
        let mut model = ModelH::new(2, 1 << 16).unwrap();
        let a = model.alloc_units(0).unwrap();
        let b = model.alloc_units(0).unwrap();
        assert_ne!(a, b);
        model.insert_node(a, 0);
        // freed node is reused before carving new space
        assert_eq!(model.alloc_units(0).unwrap(), a);
    }
}
